//! Ordered conversation log replayed to the backend on every turn.

use super::message::Message;

/// Ordered, per-session log of exchanged messages.
///
/// Insertion order is significant: the full sequence is sent verbatim as
/// context on every turn. Role alternation is not validated; two consecutive
/// user messages are accepted as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    /// Creates an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    /// Appends a message unconditionally.
    pub fn append(&mut self, message: Message) {
        tracing::trace!(role = %message.role(), len = message.content().len(), "history append");
        self.messages.push(message);
    }

    /// Returns the full ordered sequence.
    #[must_use]
    pub fn snapshot(&self) -> &[Message] {
        &self.messages
    }

    /// Iterates over messages in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Removes every message. Telemetry already recorded is unaffected.
    pub fn clear(&mut self) {
        tracing::debug!(dropped = self.messages.len(), "conversation history cleared");
        self.messages.clear();
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the history holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drops everything past `len`; used to undo an uncommitted turn.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.messages.truncate(len);
    }
}

impl<'a> IntoIterator for &'a ConversationHistory {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;

    #[test]
    fn keeps_insertion_order_without_validating_roles() {
        let mut history = ConversationHistory::new();
        history.append(Message::user("one"));
        history.append(Message::user("two"));
        history.append(Message::assistant("three"));

        let roles: Vec<Role> = history.iter().map(Message::role).collect();
        assert_eq!(roles, vec![Role::User, Role::User, Role::Assistant]);
        assert_eq!(history.snapshot()[1].content(), "two");
    }

    #[test]
    fn clear_empties_the_snapshot() {
        let mut history = ConversationHistory::new();
        history.append(Message::user("hi"));
        history.clear();
        assert!(history.snapshot().is_empty());
        assert!(history.is_empty());
    }

    #[test]
    fn truncate_rolls_back_to_checkpoint() {
        let mut history = ConversationHistory::new();
        history.append(Message::user("kept"));
        let checkpoint = history.len();
        history.append(Message::user("rolled back"));
        history.truncate(checkpoint);
        assert_eq!(history.len(), 1);
        assert_eq!(history.snapshot()[0].content(), "kept");
    }
}
