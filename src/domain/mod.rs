//! Domain layer: messages, conversation history, sessions and errors.
//!
//! Nothing in here knows about backends or telemetry transports.
//!
//! # Organization
//!
//! - [`error`]: Error types and result aliases
//! - [`message`]: Chat message and role
//! - [`history`]: Ordered conversation log
//! - [`session`]: Correlation unit owning a history

pub mod error;
pub mod history;
pub mod message;
pub mod session;

pub use error::{ConfigError, LlmObserveError, ProviderError, Result, TelemetryError};
pub use history::ConversationHistory;
pub use message::{Message, Role};
pub use session::{Session, SessionSummary};
