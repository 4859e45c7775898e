//! Error types for instrumented chat turns.
//!
//! Three concerns are kept apart so that each can be handled the way it must
//! be: [`ProviderError`] fails the current turn and reaches the caller,
//! [`TelemetryError`] is logged and swallowed by the exporter, and
//! [`ConfigError`] aborts startup before any turn runs. [`LlmObserveError`]
//! wraps all of them for code paths (like the binary) that deal with more than
//! one.

use std::time::Duration;
use thiserror::Error;

/// Failure of the model backend for one turn.
///
/// Recorded on the turn's span and in the error counter, then returned to the
/// caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The request never produced an HTTP response (connect, DNS, reset).
    #[error("backend transport error: {0}")]
    Transport(String),

    /// The backend answered with a non-success HTTP status.
    #[error("backend returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The backend answered, but the payload could not be understood.
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    /// The caller-supplied deadline elapsed before the backend answered.
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend failed after streaming had started.
    #[error("backend stream failed: {0}")]
    Stream(String),
}

impl ProviderError {
    /// Stable label used for the `error_type` metric label and the
    /// `error.type` span attribute.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Status { .. } => "http_status",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Timeout(_) => "timeout",
            Self::Stream(_) => "stream",
        }
    }
}

/// Failure while recording or exporting telemetry.
///
/// Never surfaces on the call path; the exporter logs it and moves on.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The collector could not be reached or rejected the batch.
    #[error("telemetry transport error: {0}")]
    Transport(String),

    /// A batch could not be serialized.
    #[error("telemetry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Writing a local telemetry file failed.
    #[error("telemetry IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The exporter has already been shut down.
    #[error("telemetry exporter is shut down")]
    ShutDown,
}

/// Missing or invalid setting detected at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value could not be parsed into the expected type.
    #[error("invalid value for `{key}`: {reason}")]
    Invalid {
        /// Configuration key (environment variable or TOML field).
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A configuration file could not be read or parsed.
    #[error("failed to load configuration file {path}: {reason}")]
    File {
        /// Path of the offending file.
        path: String,
        /// Underlying read or parse error.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum LlmObserveError {
    /// Model backend failure.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Telemetry failure.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Terminal or filesystem IO failure outside telemetry.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for crate operations.
pub type Result<T> = std::result::Result<T, LlmObserveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_kinds_are_stable_labels() {
        assert_eq!(ProviderError::Transport("x".into()).kind(), "transport");
        assert_eq!(
            ProviderError::Status {
                status: 500,
                body: String::new()
            }
            .kind(),
            "http_status"
        );
        assert_eq!(
            ProviderError::MalformedResponse("x".into()).kind(),
            "malformed_response"
        );
        assert_eq!(ProviderError::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(ProviderError::Stream("x".into()).kind(), "stream");
    }

    #[test]
    fn crate_error_is_transparent_over_provider_error() {
        let err: LlmObserveError = ProviderError::Transport("connection refused".into()).into();
        assert_eq!(err.to_string(), "backend transport error: connection refused");
    }
}
