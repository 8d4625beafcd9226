use std::collections::VecDeque;

/// A slice of the head document ready to be written as one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub bytes: Vec<u8>,
    pub first: bool,
    pub last: bool,
}

/// FIFO of serialized documents with resumable partial writes.
///
/// The head document keeps its written offset until its last byte has gone
/// out, so a document started on one writable opportunity is always finished
/// before anything queued behind it.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    documents: VecDeque<Vec<u8>>,
    offset: usize,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, document: String) {
        self.documents.push_back(document.into_bytes());
    }

    pub fn next_fragment(&self, max_bytes: usize) -> Option<Fragment> {
        let head = self.documents.front()?;
        let end = head.len().min(self.offset + max_bytes.max(1));
        Some(Fragment {
            bytes: head[self.offset..end].to_vec(),
            first: self.offset == 0,
            last: end == head.len(),
        })
    }

    /// Record that `written` bytes of the head went out.
    pub fn advance(&mut self, written: usize) {
        let Some(head) = self.documents.front() else {
            return;
        };
        self.offset += written;
        if self.offset >= head.len() {
            self.documents.pop_front();
            self.offset = 0;
        }
    }

    /// Drop everything, returning how many documents were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.documents.len();
        self.documents.clear();
        self.offset = 0;
        dropped
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_write_resumes_before_newer_documents() {
        let mut queue = OutboundQueue::new();
        queue.push("abcdef".into());
        queue.push("xyz".into());

        let first = queue.next_fragment(4).expect("fragment");
        assert_eq!(first.bytes, b"abcd");
        assert!(first.first && !first.last);
        queue.advance(first.bytes.len());

        queue.push("late".into());
        let second = queue.next_fragment(4).expect("fragment");
        assert_eq!(second.bytes, b"ef");
        assert!(!second.first && second.last);
        queue.advance(second.bytes.len());

        let third = queue.next_fragment(4).expect("fragment");
        assert_eq!(third.bytes, b"xyz");
        assert!(third.first && third.last);
        queue.advance(3);
        assert_eq!(queue.next_fragment(4).expect("fragment").bytes, b"late");
    }

    #[test]
    fn clear_resets_offset() {
        let mut queue = OutboundQueue::new();
        queue.push("abcdef".into());
        queue.advance(2);
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
        queue.push("zz".into());
        assert!(queue.next_fragment(16).expect("fragment").first);
    }
}
