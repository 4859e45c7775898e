//! Instrumented chat turns.
//!
//! Both instrumentors wrap a [`ModelBackend`] and run one turn at a time
//! against a [`Session`]:
//!
//! - [`CallInstrumentor`]: one request, one complete answer;
//! - [`StreamInstrumentor`]: one request, answer consumed chunk by chunk.
//!
//! Each turn opens exactly one span, appends the user message before the
//! backend is called, and on completion records the request counter, latency
//! and token metrics. A turn that fails or is abandoned leaves the history as
//! it found it. Telemetry recording never fails the turn.

mod call;
mod stream;

pub use call::CallInstrumentor;
pub use stream::{InstrumentedStream, StreamPhase, StreamInstrumentor};

use crate::backend::{ChatOptions, ChatRequest, ModelBackend, TokenUsage};
use crate::domain::{Message, ProviderError, Session};
use crate::telemetry::conventions::{
    ATTR_CHUNK_COUNT, ATTR_COMPLETION_TOKENS, ATTR_DURATION_MS, ATTR_ERROR_MESSAGE,
    ATTR_ERROR_TYPE, ATTR_MODEL, ATTR_PROMPT_TOKENS, ATTR_PROVIDER, ATTR_RESPONSE_LENGTH,
    ATTR_SESSION_ID, ATTR_SESSION_TURN, ATTR_STATUS, ATTR_STREAMING, ATTR_TOTAL_TOKENS,
    ATTR_USER_MESSAGE_LENGTH, SPAN_CHAT_REQUEST, SPAN_CHAT_STREAM, STATUS_CANCELLED, STATUS_ERROR,
    STATUS_SUCCESS, TOKEN_COMPLETION, TOKEN_PROMPT, TOKEN_TOTAL,
};
use crate::telemetry::{ActiveSpan, SpanStatus, Telemetry};
use crate::Config;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-instrumentor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentorConfig {
    /// Model identifier sent to the backend and used as the `model` label.
    pub model: String,
    /// Sampling options forwarded on every call.
    pub options: ChatOptions,
    /// Deadline for a complete answer (non-streamed), or for the stream to
    /// start and between two chunks (streamed). `None` waits forever.
    pub timeout: Option<Duration>,
}

impl InstrumentorConfig {
    /// Settings for `model` with default options and no timeout.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            options: ChatOptions::default(),
            timeout: None,
        }
    }

    /// Sets the sampling options.
    #[must_use]
    pub const fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Settings taken from the application configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let settings = Self::new(config.model.clone()).with_options(ChatOptions {
            temperature: Some(config.temperature),
            max_tokens: Some(config.max_tokens),
        });
        match config.request_timeout_secs {
            Some(secs) => settings.with_timeout(Duration::from_secs(secs)),
            None => settings,
        }
    }
}

/// Result of a successful turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Full assistant answer, as committed to history.
    pub content: String,
    /// Token counts, if the backend reported them.
    pub usage: Option<TokenUsage>,
    /// Wall-clock duration of the backend call in milliseconds.
    pub duration_ms: f64,
}

/// State shared by both instrumentors.
struct Core {
    backend: Arc<dyn ModelBackend>,
    telemetry: Telemetry,
    config: InstrumentorConfig,
}

impl Core {
    fn new(
        backend: Arc<dyn ModelBackend>,
        telemetry: Telemetry,
        config: InstrumentorConfig,
    ) -> Self {
        tracing::debug!(
            model = %config.model,
            provider = backend.provider(),
            timeout = ?config.timeout,
            "instrumentor created"
        );
        Self {
            backend,
            telemetry,
            config,
        }
    }
}

/// A turn between its start and its outcome.
///
/// Holds the session borrow, the open span and the history checkpoint.
/// [`PendingTurn::succeed`] and [`PendingTurn::fail`] consume it; dropping it
/// instead counts the request as cancelled, rolls the history back and closes
/// the span as cancelled.
struct PendingTurn<'a> {
    session: &'a mut Session,
    checkpoint: usize,
    span: Option<ActiveSpan>,
    telemetry: Telemetry,
    model: String,
    started: Instant,
}

impl<'a> PendingTurn<'a> {
    fn begin(core: &Core, session: &'a mut Session, user_text: &str, streaming: bool) -> Self {
        let turn = session.begin_turn();
        let name = if streaming { SPAN_CHAT_STREAM } else { SPAN_CHAT_REQUEST };

        let mut span = core.telemetry.recorder().start(name);
        span.set_attributes([
            KeyValue::new(ATTR_MODEL, core.config.model.clone()),
            KeyValue::new(ATTR_PROVIDER, core.backend.provider().to_string()),
            KeyValue::new(ATTR_USER_MESSAGE_LENGTH, char_len(user_text)),
            KeyValue::new(ATTR_SESSION_ID, session.id().to_string()),
            KeyValue::new(ATTR_SESSION_TURN, saturating_i64(turn)),
            KeyValue::new(ATTR_STREAMING, streaming),
        ]);

        let checkpoint = session.history().len();
        session.history_mut().append(Message::user(user_text));

        tracing::debug!(
            session_id = %session.id(),
            turn,
            streaming,
            history_len = session.history().len(),
            "turn started"
        );

        Self {
            session,
            checkpoint,
            span: Some(span),
            telemetry: core.telemetry.clone(),
            model: core.config.model.clone(),
            started: Instant::now(),
        }
    }

    /// Request carrying the full history, newest user message last.
    fn request(&self, options: ChatOptions) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: self.session.history().snapshot().to_vec(),
            options,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Commits the answer and records the successful turn.
    fn succeed(
        mut self,
        content: String,
        usage: Option<TokenUsage>,
        chunk_count: Option<u64>,
    ) -> TurnOutcome {
        let duration_ms = self.elapsed_ms();
        let metrics = self.telemetry.metrics();

        metrics.increment_requests(&self.model, STATUS_SUCCESS);
        if let Some(usage) = usage {
            metrics.increment_tokens(&self.model, TOKEN_PROMPT, usage.prompt_tokens);
            metrics.increment_tokens(&self.model, TOKEN_COMPLETION, usage.completion_tokens);
            metrics.increment_tokens(&self.model, TOKEN_TOTAL, usage.total_tokens());
        }
        metrics.observe_latency(&self.model, duration_ms);

        let counts = usage.unwrap_or_default();
        if let Some(mut span) = self.span.take() {
            span.set_attributes([
                KeyValue::new(ATTR_RESPONSE_LENGTH, char_len(&content)),
                KeyValue::new(ATTR_PROMPT_TOKENS, saturating_i64(counts.prompt_tokens)),
                KeyValue::new(ATTR_COMPLETION_TOKENS, saturating_i64(counts.completion_tokens)),
                KeyValue::new(ATTR_TOTAL_TOKENS, saturating_i64(counts.total_tokens())),
                KeyValue::new(ATTR_DURATION_MS, duration_ms),
                KeyValue::new(ATTR_STATUS, STATUS_SUCCESS),
            ]);
            if let Some(chunks) = chunk_count {
                span.set_attribute(KeyValue::new(ATTR_CHUNK_COUNT, saturating_i64(chunks)));
            }
            span.end(SpanStatus::Ok);
        }

        self.session
            .history_mut()
            .append(Message::assistant(content.clone()));

        tracing::debug!(
            session_id = %self.session.id(),
            duration_ms,
            total_tokens = counts.total_tokens(),
            "turn completed"
        );

        TurnOutcome {
            content,
            usage,
            duration_ms,
        }
    }

    /// Rolls the history back and records the failed turn.
    fn fail(mut self, error: &ProviderError, chunk_count: Option<u64>) {
        let duration_ms = self.elapsed_ms();
        let metrics = self.telemetry.metrics();

        metrics.increment_errors(&self.model, error.kind());
        metrics.increment_requests(&self.model, STATUS_ERROR);

        let message = error.to_string();
        if let Some(mut span) = self.span.take() {
            span.set_attributes([
                KeyValue::new(ATTR_STATUS, STATUS_ERROR),
                KeyValue::new(ATTR_ERROR_TYPE, error.kind()),
                KeyValue::new(ATTR_ERROR_MESSAGE, message.clone()),
                KeyValue::new(ATTR_DURATION_MS, duration_ms),
            ]);
            if let Some(chunks) = chunk_count {
                span.set_attribute(KeyValue::new(ATTR_CHUNK_COUNT, saturating_i64(chunks)));
            }
            span.record_exception(error.kind(), &message);
            span.end(SpanStatus::error(message));
        }

        self.session.history_mut().truncate(self.checkpoint);

        tracing::warn!(
            session_id = %self.session.id(),
            error_type = error.kind(),
            error = %error,
            duration_ms,
            "turn failed"
        );
    }
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        let Some(mut span) = self.span.take() else {
            return;
        };

        self.telemetry
            .metrics()
            .increment_requests(&self.model, STATUS_CANCELLED);
        span.set_attribute(KeyValue::new(ATTR_STATUS, STATUS_CANCELLED));
        span.end(SpanStatus::Cancelled);
        self.session.history_mut().truncate(self.checkpoint);

        tracing::debug!(session_id = %self.session.id(), "turn cancelled");
    }
}

fn char_len(text: &str) -> i64 {
    saturating_i64(text.chars().count() as u64)
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::backend::scripted::ScriptedBackend;
    use crate::telemetry::{ExportSettings, MemorySink, SpanRecord, Telemetry};
    use std::sync::Arc;

    pub(crate) struct Harness {
        pub(crate) backend: Arc<ScriptedBackend>,
        pub(crate) telemetry: Telemetry,
        pub(crate) sink: Arc<MemorySink>,
    }

    impl Harness {
        pub(crate) fn new(backend: ScriptedBackend) -> Self {
            let sink = Arc::new(MemorySink::new());
            let telemetry = Telemetry::with_sink(sink.clone(), ExportSettings::immediate());
            Self {
                backend: Arc::new(backend),
                telemetry,
                sink,
            }
        }

        pub(crate) async fn spans(&self) -> Vec<SpanRecord> {
            self.telemetry.flush().await.unwrap();
            self.sink.spans()
        }

        pub(crate) fn counter(&self, name: &str, series: &[(&str, &str)]) -> u64 {
            self.telemetry.metrics().counter(name, series)
        }
    }
}
