//! Non-streamed turns.

use super::{Core, InstrumentorConfig, PendingTurn, TurnOutcome};
use crate::backend::ModelBackend;
use crate::domain::{ProviderError, Session};
use crate::telemetry::Telemetry;
use std::sync::Arc;
use tracing::Instrument;

/// Runs one request/response turn with a span and metrics around it.
pub struct CallInstrumentor {
    core: Core,
}

impl std::fmt::Debug for CallInstrumentor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInstrumentor")
            .field("config", &self.core.config)
            .finish_non_exhaustive()
    }
}

impl CallInstrumentor {
    /// Creates an instrumentor over `backend`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        telemetry: Telemetry,
        config: InstrumentorConfig,
    ) -> Self {
        Self {
            core: Core::new(backend, telemetry, config),
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn config(&self) -> &InstrumentorConfig {
        &self.core.config
    }

    /// Sends `user_text` with the full session history and waits for the
    /// answer.
    ///
    /// On success the user and assistant messages are both in history. On
    /// failure the history is unchanged, the error is recorded on the span and
    /// in the error counter, and returned as is. Dropping the returned future
    /// before it completes counts the request as cancelled.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`ProviderError`], or [`ProviderError::Timeout`]
    /// when the configured timeout elapses first.
    pub async fn execute(
        &self,
        session: &mut Session,
        user_text: &str,
    ) -> Result<TurnOutcome, ProviderError> {
        let diagnostics = tracing::info_span!(
            "chat_turn",
            session_id = %session.id(),
            model = %self.core.config.model,
            streaming = false
        );
        self.run(session, user_text).instrument(diagnostics).await
    }

    async fn run(
        &self,
        session: &mut Session,
        user_text: &str,
    ) -> Result<TurnOutcome, ProviderError> {
        let turn = PendingTurn::begin(&self.core, session, user_text, false);
        let request = turn.request(self.core.config.options);

        let call = self.core.backend.chat(request);
        let result = match self.core.config.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(ProviderError::Timeout(limit))),
            None => call.await,
        };

        match result {
            Ok(response) => Ok(turn.succeed(response.content, response.usage, None)),
            Err(error) => {
                turn.fail(&error, None);
                Err(error)
            }
        }
    }
}
