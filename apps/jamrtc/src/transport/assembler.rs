use super::TransportError;

/// Per-connection buffer that turns inbound chunks into whole documents.
///
/// Nothing is delivered until a chunk flagged final arrives; the buffer is
/// cleared after every delivery and after every rejected document. Once a
/// document is rejected, its remaining chunks are skipped up to and
/// including the final one.
#[derive(Debug)]
pub struct Assembler {
    buffer: Vec<u8>,
    max_message_bytes: usize,
    discarding: bool,
}

impl Assembler {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_message_bytes,
            discarding: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8], is_final: bool) -> Result<Option<String>, TransportError> {
        if self.discarding {
            self.discarding = !is_final;
            return Ok(None);
        }
        let total = self.buffer.len() + chunk.len();
        if total > self.max_message_bytes {
            self.buffer.clear();
            self.discarding = !is_final;
            return Err(TransportError::MessageTooLarge(total));
        }
        self.buffer.extend_from_slice(chunk);
        if !is_final {
            return Ok(None);
        }
        let bytes = std::mem::take(&mut self.buffer);
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| TransportError::Encoding)
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_only_on_final_chunk() {
        let mut assembler = Assembler::new(1024);
        assert_eq!(assembler.push(br#"{"janus":"#, false).expect("push"), None);
        assert_eq!(assembler.push(br#""ack""#, false).expect("push"), None);
        let doc = assembler.push(b"}", true).expect("push").expect("document");
        assert_eq!(doc, r#"{"janus":"ack"}"#);
        assert_eq!(assembler.pending_bytes(), 0);
    }

    #[test]
    fn oversized_document_is_dropped_and_buffer_reset() {
        let mut assembler = Assembler::new(8);
        assert!(assembler.push(b"12345", false).expect("push").is_none());
        assert!(matches!(
            assembler.push(b"67890", true),
            Err(TransportError::MessageTooLarge(10))
        ));
        assert_eq!(assembler.pending_bytes(), 0);
        assert_eq!(assembler.push(b"ok", true).expect("push").as_deref(), Some("ok"));
    }

    #[test]
    fn rest_of_rejected_document_is_skipped() {
        let mut assembler = Assembler::new(8);
        assert!(matches!(
            assembler.push(br#"{"a":"123"#, false),
            Err(TransportError::MessageTooLarge(9))
        ));
        assert_eq!(assembler.push(b"45", false).expect("push"), None);
        assert_eq!(assembler.push(br#""}"#, true).expect("push"), None);
        assert_eq!(assembler.pending_bytes(), 0);
        assert_eq!(
            assembler.push(b"{}", true).expect("push").as_deref(),
            Some("{}")
        );
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut assembler = Assembler::new(64);
        assert!(matches!(assembler.push(&[0xff, 0xfe], true), Err(TransportError::Encoding)));
        assert_eq!(assembler.pending_bytes(), 0);
    }
}
