//! Model backend abstraction.
//!
//! This module defines the [`ModelBackend`] trait, the opaque capability the
//! instrumentors wrap: "send messages, get content and token counts", either in
//! one response or as a lazy sequence of text deltas. Implementations own
//! their transport; the instrumentors never look past this trait.
//!
//! # Implementations
//!
//! - [`OllamaBackend`]: Ollama `/api/chat` over HTTP

pub mod ollama;
#[cfg(test)]
pub(crate) mod scripted;

pub use ollama::OllamaBackend;

use crate::domain::{Message, ProviderError};
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Lazy, forward-only sequence of text deltas produced by a streaming call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChunkDelta, ProviderError>> + Send>>;

/// Sampling options forwarded to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens.
    pub max_tokens: Option<u32>,
}

/// One backend call: model, full ordered context and options.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation replayed as context, newest message last.
    pub messages: Vec<Message>,
    /// Sampling options.
    pub options: ChatOptions,
}

/// Token counts reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt (the replayed context).
    pub prompt_tokens: u64,
    /// Tokens generated.
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Creates a usage record.
    #[must_use]
    pub const fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Prompt plus completion.
    #[must_use]
    pub const fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Complete answer of a non-streamed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResponse {
    /// Generated text.
    pub content: String,
    /// Token counts, `None` when the backend did not report them.
    pub usage: Option<TokenUsage>,
}

/// One incremental piece of a streamed answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkDelta {
    /// Text appended by this chunk; may be empty.
    pub content: String,
    /// Token counts, usually only present on the final chunk.
    pub usage: Option<TokenUsage>,
}

impl ChunkDelta {
    /// A delta carrying only text.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }
}

/// Generative-model backend.
///
/// Both calls may suspend for an unbounded time (network, inference); callers
/// that need a deadline wrap them, see
/// [`InstrumentorConfig::timeout`](crate::instrument::InstrumentorConfig).
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Short vendor name recorded as `llm.provider` (e.g. `"ollama"`).
    fn provider(&self) -> &str;

    /// Sends the request and waits for the complete answer.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the call fails or the answer is malformed.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Sends the request in streaming mode.
    ///
    /// The returned stream ends after the final delta; a failure mid-stream is
    /// yielded as an `Err` item.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the streaming request cannot be issued.
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_tokens_sums_prompt_and_completion() {
        assert_eq!(TokenUsage::new(3, 1).total_tokens(), 4);
        assert_eq!(TokenUsage::new(u64::MAX, 1).total_tokens(), u64::MAX);
    }
}
