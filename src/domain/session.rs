//! Interactive session model.
//!
//! A [`Session`] is the correlation unit threaded through spans and metrics for
//! one interactive run. It owns its [`ConversationHistory`] exclusively, and
//! both instrumentors borrow it mutably for the duration of a turn, so at most
//! one turn per session can be in flight.

use super::history::ConversationHistory;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One interactive run.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    turn_count: u64,
    history: ConversationHistory,
}

impl Session {
    /// Creates a session whose id is derived from the current time, in the form
    /// `session_YYYYmmdd_HHMMSS`.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self::with_id(format!("session_{}", now.format("%Y%m%d_%H%M%S")))
    }

    /// Creates a session with an explicit id.
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            turn_count: 0,
            history: ConversationHistory::new(),
        }
    }

    /// Correlation id attached to every span of this session.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Number of turns started, whatever their outcome.
    #[must_use]
    pub const fn turn_count(&self) -> u64 {
        self.turn_count
    }

    /// Conversation so far.
    #[must_use]
    pub const fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Mutable access to the conversation, e.g. to `clear()` it.
    pub fn history_mut(&mut self) -> &mut ConversationHistory {
        &mut self.history
    }

    /// Counts a new turn and returns its 1-based number.
    pub(crate) fn begin_turn(&mut self) -> u64 {
        self.turn_count = self.turn_count.saturating_add(1);
        self.turn_count
    }

    /// End-of-run figures.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            turns: self.turn_count,
            total_messages: self.history.len(),
            duration_secs: (Utc::now() - self.created_at).num_seconds().max(0),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Figures reported when a session ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Session id.
    pub session_id: String,
    /// Turns started.
    pub turns: u64,
    /// Messages currently in history.
    pub total_messages: usize,
    /// Wall-clock lifetime of the session.
    pub duration_secs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_id_uses_timestamp_format() {
        let session = Session::new();
        assert!(session.id().starts_with("session_"));
        assert_eq!(session.id().len(), "session_20240101_120000".len());
    }

    #[test]
    fn begin_turn_counts_every_turn() {
        let mut session = Session::with_id("s");
        assert_eq!(session.begin_turn(), 1);
        assert_eq!(session.begin_turn(), 2);
        assert_eq!(session.turn_count(), 2);
        assert_eq!(session.summary().turns, 2);
    }
}
