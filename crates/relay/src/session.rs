//! Per-connection session state.
//!
//! A [`Session`] is owned by exactly one connection task and mutated one
//! command at a time, so it needs no locking.

use tokio_util::bytes::Bytes;

use crate::bridge::protocol::Message;

/// Unique identifier for a client session, used for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    current: Message,
    original: Message,
    max_message_size: usize,
}

impl Session {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            id: SessionId::new(),
            current: Message::default(),
            original: Message::default(),
            max_message_size,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Replace the sentence wholesale. Also resets the snapshot that
    /// non-chaining pipelines start from.
    pub fn set_sentence(&mut self, text: impl Into<Bytes>) {
        let text = Message::bounded(text, self.max_message_size);
        self.original = text.clone();
        self.current = text;
    }

    pub fn current_text(&self) -> &Message {
        &self.current
    }

    /// The sentence as of the last `set_sentence`.
    pub fn original_text(&self) -> &Message {
        &self.original
    }

    pub(crate) fn replace_current(&mut self, text: Message) {
        self.current = Message::bounded(text.into_bytes(), self.max_message_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_empty() {
        let session = Session::new(100);
        assert!(session.current_text().is_empty());
        assert!(session.original_text().is_empty());
    }

    #[test]
    fn set_sentence_replaces_not_appends() {
        let mut session = Session::new(100);
        session.set_sentence("foo");
        session.set_sentence("bar");
        assert_eq!(session.current_text().as_bytes(), b"bar");
        assert_eq!(session.original_text().as_bytes(), b"bar");
    }

    #[test]
    fn set_sentence_is_idempotent() {
        let mut session = Session::new(100);
        session.set_sentence("same");
        let first = session.current_text().clone();
        session.set_sentence("same");
        assert_eq!(session.current_text(), &first);
        assert_eq!(session.original_text(), &first);
    }

    #[test]
    fn sentence_is_bounded() {
        let mut session = Session::new(4);
        session.set_sentence("too long");
        assert_eq!(session.current_text().as_bytes(), b"too ");
    }

    #[test]
    fn replace_current_keeps_original() {
        let mut session = Session::new(100);
        session.set_sentence("Hello");
        session.replace_current(Message::bounded("OLLEH", 100));
        assert_eq!(session.current_text().as_bytes(), b"OLLEH");
        assert_eq!(session.original_text().as_bytes(), b"Hello");
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(Session::new(1).id(), Session::new(1).id());
    }
}
