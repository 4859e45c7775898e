//! Ollama `/api/chat` backend.
//!
//! Non-streamed calls post `stream: false` and read a single JSON object.
//! Streamed calls post `stream: true` and parse the newline-delimited JSON body
//! incrementally: every line carries a `message.content` delta, and the line
//! with `done: true` ends the answer and carries the token counts.

use super::{
    ChatOptions, ChatRequest, ChatResponse, ChunkDelta, ChunkStream, ModelBackend, TokenUsage,
};
use crate::domain::{ConfigError, Message, ProviderError};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connect timeout applied to every request.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest error body kept in [`ProviderError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Ollama client bound to one daemon.
pub struct OllamaBackend {
    client: Client,
    endpoint: Url,
    request_timeout: Option<Duration>,
}

impl fmt::Debug for OllamaBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OllamaBackend")
            .field("endpoint", &self.endpoint.as_str())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl OllamaBackend {
    /// Creates a backend for the daemon at `host` (e.g. `http://localhost:11434`).
    ///
    /// `request_timeout` bounds non-streamed calls end to end; streamed calls
    /// are bounded per chunk by the instrumentor instead.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `host` is not an http(s) URL or the
    /// HTTP client cannot be built.
    pub fn new(host: &str, request_timeout: Option<Duration>) -> Result<Self, ConfigError> {
        let base = sanitize_base_url(host)?;
        let endpoint = base
            .join("api/chat")
            .map_err(|e| ConfigError::invalid("backend_host", e.to_string()))?;

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                ConfigError::invalid("backend_host", format!("failed to build HTTP client: {e}"))
            })?;

        tracing::debug!(endpoint = %endpoint, "ollama backend configured");

        Ok(Self {
            client,
            endpoint,
            request_timeout,
        })
    }

    /// Chat endpoint this backend posts to.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = WireRequest {
            model: &request.model,
            messages: &request.messages,
            stream,
            options: WireOptions::from_options(request.options),
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&body);
        if !stream {
            if let Some(timeout) = self.request_timeout {
                builder = builder.timeout(timeout);
            }
        }

        let response = builder.send().await.map_err(|e| self.map_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate_on_char_boundary(&mut body, MAX_ERROR_BODY);
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    fn map_send_error(&self, error: &reqwest::Error) -> ProviderError {
        match self.request_timeout {
            Some(timeout) if error.is_timeout() => ProviderError::Timeout(timeout),
            _ => ProviderError::Transport(error.to_string()),
        }
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn provider(&self) -> &str {
        "ollama"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let response = self.post(&request, false).await?;

        let mut wire: WireResponse = response
            .json()
            .await
            .map_err(|e| match self.request_timeout {
                Some(timeout) if e.is_timeout() => ProviderError::Timeout(timeout),
                _ => ProviderError::MalformedResponse(e.to_string()),
            })?;

        if let Some(error) = wire.error.take() {
            return Err(ProviderError::MalformedResponse(error));
        }

        let usage = wire.usage();
        let message = wire
            .message
            .ok_or_else(|| {
                ProviderError::MalformedResponse("response has no `message` field".to_string())
            })?;

        Ok(ChatResponse {
            content: message.content,
            usage,
        })
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.post(&request, true).await?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();

        let chunks = stream::unfold(NdjsonReader::new(bytes), |mut reader| async move {
            let item = reader.next_delta().await?;
            Some((item, reader))
        });

        Ok(chunks.boxed())
    }
}

/// Incremental parser over the NDJSON body of a streamed answer.
struct NdjsonReader {
    bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    buffer: Vec<u8>,
    finished: bool,
    saw_done: bool,
}

impl NdjsonReader {
    fn new(bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>) -> Self {
        Self {
            bytes,
            buffer: Vec::new(),
            finished: false,
            saw_done: false,
        }
    }

    async fn next_delta(&mut self) -> Option<Result<ChunkDelta, ProviderError>> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(line) = self.take_line() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some(self.parse_line(&line));
            }

            match self.bytes.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(ProviderError::Stream(e.to_string())));
                }
                None => {
                    let rest = std::mem::take(&mut self.buffer);
                    if !rest.iter().all(u8::is_ascii_whitespace) {
                        let item = self.parse_line(&rest);
                        self.finished = true;
                        return Some(item);
                    }
                    self.finished = true;
                    if self.saw_done {
                        return None;
                    }
                    return Some(Err(ProviderError::Stream(
                        "stream closed before the final chunk".to_string(),
                    )));
                }
            }
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let newline = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
        line.pop();
        Some(line)
    }

    fn parse_line(&mut self, line: &[u8]) -> Result<ChunkDelta, ProviderError> {
        let mut wire: WireResponse = match serde_json::from_slice(line) {
            Ok(wire) => wire,
            Err(e) => {
                self.finished = true;
                return Err(ProviderError::MalformedResponse(format!("invalid stream line: {e}")));
            }
        };

        if let Some(error) = wire.error.take() {
            self.finished = true;
            return Err(ProviderError::Stream(error));
        }

        if wire.done {
            self.finished = true;
            self.saw_done = true;
        }

        let usage = if wire.done { wire.usage() } else { None };
        Ok(ChunkDelta {
            content: wire.message.map(|m| m.content).unwrap_or_default(),
            usage,
        })
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WireOptions>,
}

#[derive(Serialize)]
struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl WireOptions {
    fn from_options(options: ChatOptions) -> Option<Self> {
        if options.temperature.is_none() && options.max_tokens.is_none() {
            return None;
        }
        Some(Self {
            temperature: options.temperature,
            num_predict: options.max_tokens,
        })
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

impl WireResponse {
    fn usage(&self) -> Option<TokenUsage> {
        if self.prompt_eval_count.is_none() && self.eval_count.is_none() {
            return None;
        }
        Some(TokenUsage::new(
            self.prompt_eval_count.unwrap_or(0),
            self.eval_count.unwrap_or(0),
        ))
    }
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

fn sanitize_base_url(host: &str) -> Result<Url, ConfigError> {
    let trimmed = host.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };

    let url = Url::parse(&with_slash)
        .map_err(|e| ConfigError::invalid("backend_host", e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::invalid(
            "backend_host",
            format!("unsupported scheme `{}`", url.scheme()),
        ));
    }
    Ok(url)
}

fn truncate_on_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}
