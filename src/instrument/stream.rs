//! Streamed turns.
//!
//! An [`InstrumentedStream`] is a state machine driven by polling:
//!
//! ```text
//! Init ──request accepted──▶ Streaming ──last chunk──▶ Done
//!   │                           │
//!   └──────request failed───────┴──chunk failed / idle timeout──▶ Error
//! ```
//!
//! The span is opened and the user message appended when the stream is
//! created; the assistant message is only committed in `Done`. Dropping the
//! stream in `Init` or `Streaming` closes the span as cancelled and rolls the
//! history back.

use super::{Core, InstrumentorConfig, PendingTurn, TurnOutcome};
use crate::backend::{ChunkStream, ModelBackend, TokenUsage};
use crate::domain::{ProviderError, Session};
use crate::telemetry::Telemetry;
use futures_util::future::BoxFuture;
use futures_util::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// Runs streamed turns with a span and metrics around the whole stream.
pub struct StreamInstrumentor {
    core: Core,
}

impl std::fmt::Debug for StreamInstrumentor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamInstrumentor")
            .field("config", &self.core.config)
            .finish_non_exhaustive()
    }
}

impl StreamInstrumentor {
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

    /// Starts a streamed turn for `user_text`.
    ///
    /// The request is issued on first poll. Text chunks are yielded as they
    /// arrive; a failure is yielded once as the final `Err` item. The session
    /// stays borrowed until the stream is dropped, so no other turn can start
    /// on it meanwhile.
    pub fn execute<'a>(&self, session: &'a mut Session, user_text: &str) -> InstrumentedStream<'a> {
        let diagnostics = tracing::info_span!(
            "chat_turn",
            session_id = %session.id(),
            model = %self.core.config.model,
            streaming = true
        );
        let _entered = diagnostics.enter();

        let turn = PendingTurn::begin(&self.core, session, user_text, true);
        let request = turn.request(self.core.config.options);
        let backend = Arc::clone(&self.core.backend);
        let timeout = self.core.config.timeout;

        let opening: BoxFuture<'static, Result<ChunkStream, ProviderError>> = Box::pin(async move {
            let call = backend.chat_stream(request);
            match timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .unwrap_or(Err(ProviderError::Timeout(limit))),
                None => call.await,
            }
        });

        InstrumentedStream {
            state: State::Init(opening),
            turn: Some(turn),
            content: String::new(),
            usage: None,
            chunk_count: 0,
            idle_timeout: timeout,
            idle: None,
            yielded: false,
            outcome: None,
        }
    }
}

/// Observable phase of an [`InstrumentedStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Request not yet accepted by the backend.
    Init,
    /// Receiving chunks.
    Streaming,
    /// All chunks received and committed.
    Done,
    /// Failed; the error has been yielded.
    Error,
}

enum State {
    Init(BoxFuture<'static, Result<ChunkStream, ProviderError>>),
    Streaming(ChunkStream),
    Done,
    Error,
}

/// Stream of text chunks of one instrumented turn.
#[must_use = "streams do nothing unless polled"]
pub struct InstrumentedStream<'a> {
    state: State,
    turn: Option<PendingTurn<'a>>,
    content: String,
    usage: Option<TokenUsage>,
    chunk_count: u64,
    idle_timeout: Option<Duration>,
    idle: Option<Pin<Box<Sleep>>>,
    yielded: bool,
    outcome: Option<TurnOutcome>,
}

impl std::fmt::Debug for InstrumentedStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentedStream")
            .field("phase", &self.phase())
            .field("chunk_count", &self.chunk_count)
            .field("content_len", &self.content.len())
            .finish_non_exhaustive()
    }
}

impl InstrumentedStream<'_> {
    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> StreamPhase {
        match self.state {
            State::Init(_) => StreamPhase::Init,
            State::Streaming(_) => StreamPhase::Streaming,
            State::Done => StreamPhase::Done,
            State::Error => StreamPhase::Error,
        }
    }

    /// Outcome of the turn, once the stream reached [`StreamPhase::Done`].
    #[must_use]
    pub const fn outcome(&self) -> Option<&TurnOutcome> {
        self.outcome.as_ref()
    }

    fn arm_idle_timer(&mut self) {
        let Some(limit) = self.idle_timeout else {
            return;
        };
        let deadline = Instant::now() + limit;
        match self.idle.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.idle = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
    }

    fn idle_expired(&mut self, cx: &mut Context<'_>) -> bool {
        self.idle
            .as_mut()
            .is_some_and(|sleep| sleep.as_mut().poll(cx).is_ready())
    }

    fn fail(&mut self, error: ProviderError) -> ProviderError {
        self.state = State::Error;
        self.idle = None;
        self.content.clear();
        if let Some(turn) = self.turn.take() {
            turn.fail(&error, Some(self.chunk_count));
        }
        error
    }

    fn complete(&mut self) {
        self.state = State::Done;
        self.idle = None;
        if let Some(turn) = self.turn.take() {
            let content = std::mem::take(&mut self.content);
            let outcome = turn.succeed(content, self.usage, Some(self.chunk_count));
            self.content.clone_from(&outcome.content);
            self.outcome = Some(outcome);
        }
    }
}

impl Stream for InstrumentedStream<'_> {
    type Item = Result<String, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        // The idle deadline covers waiting on the backend only, not the time
        // the caller took before asking for the next chunk.
        if std::mem::take(&mut this.yielded) && matches!(this.state, State::Streaming(_)) {
            this.arm_idle_timer();
        }

        loop {
            match &mut this.state {
                State::Init(opening) => match opening.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(chunks)) => {
                        this.state = State::Streaming(chunks);
                        this.arm_idle_timer();
                    }
                    Poll::Ready(Err(error)) => return Poll::Ready(Some(Err(this.fail(error)))),
                },
                State::Streaming(chunks) => match chunks.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(delta))) => {
                        if delta.usage.is_some() {
                            this.usage = delta.usage;
                        }
                        if delta.content.is_empty() {
                            this.arm_idle_timer();
                            continue;
                        }
                        this.chunk_count += 1;
                        this.content.push_str(&delta.content);
                        this.yielded = true;
                        return Poll::Ready(Some(Ok(delta.content)));
                    }
                    Poll::Ready(Some(Err(error))) => {
                        return Poll::Ready(Some(Err(this.fail(error))));
                    }
                    Poll::Ready(None) => {
                        this.complete();
                        return Poll::Ready(None);
                    }
                    Poll::Pending => {
                        if this.idle_expired(cx) {
                            let limit = this.idle_timeout.unwrap_or_default();
                            return Poll::Ready(Some(Err(this.fail(ProviderError::Timeout(limit)))));
                        }
                        return Poll::Pending;
                    }
                },
                State::Done | State::Error => return Poll::Ready(None),
            }
        }
    }
}
