//! Transaction token to awaiting-handle bookkeeping.
//!
//! Tokens are one-shot: the first response carrying a token consumes it.
//! Server-initiated events, and events following an `ack` that already
//! consumed the token, are attributed through the sender handle id instead.
//! With two requests outstanding on one handle that fallback can attribute an
//! event to the wrong request; the engine only ever relies on the handle, not
//! on which request it answers.

use std::collections::HashMap;

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::directory::HandleKey;

const TOKEN_LEN: usize = 12;

/// How an inbound message was matched to a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Transaction(HandleKey),
    Sender(HandleKey),
    Unmatched,
}

impl Resolution {
    pub fn key(self) -> Option<HandleKey> {
        match self {
            Resolution::Transaction(key) | Resolution::Sender(key) => Some(key),
            Resolution::Unmatched => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<String, HandleKey>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token nobody waits for (create, keepalive, trickle, detach, destroy).
    pub fn token(&self) -> String {
        loop {
            let token = random_token();
            if !self.pending.contains_key(&token) {
                return token;
            }
        }
    }

    /// Allocate a token for `key`. Must happen before the request is sent.
    pub fn register(&mut self, key: HandleKey) -> String {
        let token = self.token();
        self.pending.insert(token.clone(), key);
        token
    }

    /// Consume a token.
    pub fn take(&mut self, token: &str) -> Option<HandleKey> {
        self.pending.remove(token)
    }

    pub fn resolve(
        &mut self,
        transaction: Option<&str>,
        sender: Option<u64>,
        by_handle_id: impl FnOnce(u64) -> Option<HandleKey>,
    ) -> Resolution {
        if let Some(key) = transaction.and_then(|token| self.take(token)) {
            return Resolution::Transaction(key);
        }
        match sender.and_then(by_handle_id) {
            Some(key) => Resolution::Sender(key),
            None => Resolution::Unmatched,
        }
    }

    /// Forget every token owned by a destroyed handle.
    pub fn release(&mut self, key: HandleKey) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, owner| *owner != key);
        before - self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Directory, HandleKind};

    fn keys() -> (Directory, HandleKey, HandleKey) {
        let mut directory = Directory::new("local");
        let a = directory.insert_local(HandleKind::LocalMicWebcam);
        let b = directory.insert_local(HandleKind::LocalInstrument);
        (directory, a, b)
    }

    #[test]
    fn token_resolves_exactly_once() {
        let (_, a, _) = keys();
        let mut correlator = Correlator::new();
        let token = correlator.register(a);
        assert_eq!(
            correlator.resolve(Some(&token), None, |_| None),
            Resolution::Transaction(a)
        );
        assert_eq!(
            correlator.resolve(Some(&token), None, |_| None),
            Resolution::Unmatched
        );
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn stale_token_falls_back_to_sender() {
        let (mut directory, a, _) = keys();
        directory.assign_handle_id(a, 7).expect("assign");
        let mut correlator = Correlator::new();
        let token = correlator.register(a);
        correlator.take(&token);
        assert_eq!(
            correlator.resolve(Some(&token), Some(7), |id| directory.handle_by_id(id)),
            Resolution::Sender(a)
        );
        assert_eq!(
            correlator.resolve(None, Some(8), |id| directory.handle_by_id(id)),
            Resolution::Unmatched
        );
    }

    #[test]
    fn release_drops_only_that_handle() {
        let (_, a, b) = keys();
        let mut correlator = Correlator::new();
        correlator.register(a);
        correlator.register(a);
        let kept = correlator.register(b);
        assert_eq!(correlator.release(a), 2);
        assert_eq!(correlator.take(&kept), Some(b));
    }

    #[test]
    fn tokens_are_distinct() {
        let (_, a, _) = keys();
        let mut correlator = Correlator::new();
        let first = correlator.register(a);
        let second = correlator.register(a);
        assert_ne!(first, second);
        assert_eq!(first.len(), TOKEN_LEN);
    }
}
