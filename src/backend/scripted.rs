//! In-process backend that replays a fixed script, for tests.

use super::{ChatRequest, ChatResponse, ChunkDelta, ChunkStream, ModelBackend, TokenUsage};
use crate::domain::ProviderError;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

enum Step {
    Reply(Result<ChatResponse, ProviderError>),
    Stream {
        chunks: Vec<Result<ChunkDelta, ProviderError>>,
        hang_after: bool,
    },
    Paced {
        chunks: Vec<Result<ChunkDelta, ProviderError>>,
        gap: Duration,
    },
    RejectStream(ProviderError),
    Hang,
}

/// Backend answering each call with the next scripted step.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn push(self, step: Step) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }

    pub(crate) fn reply(self, content: &str, usage: Option<TokenUsage>) -> Self {
        self.push(Step::Reply(Ok(ChatResponse {
            content: content.to_string(),
            usage,
        })))
    }

    pub(crate) fn fail(self, error: ProviderError) -> Self {
        self.push(Step::Reply(Err(error)))
    }

    pub(crate) fn stream(self, chunks: Vec<Result<ChunkDelta, ProviderError>>) -> Self {
        self.push(Step::Stream {
            chunks,
            hang_after: false,
        })
    }

    /// Yields `chunks`, then never produces another item.
    pub(crate) fn stream_then_hang(self, chunks: Vec<Result<ChunkDelta, ProviderError>>) -> Self {
        self.push(Step::Stream {
            chunks,
            hang_after: true,
        })
    }

    /// Yields `chunks`, each one `gap` after the previous.
    pub(crate) fn stream_paced(
        self,
        chunks: Vec<Result<ChunkDelta, ProviderError>>,
        gap: Duration,
    ) -> Self {
        self.push(Step::Paced { chunks, gap })
    }

    pub(crate) fn reject_stream(self, error: ProviderError) -> Self {
        self.push(Step::RejectStream(error))
    }

    pub(crate) fn hang(self) -> Self {
        self.push(Step::Hang)
    }

    /// Every request received so far, in order.
    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_step(&self, request: ChatRequest) -> Step {
        self.requests.lock().unwrap().push(request);
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted backend ran out of steps")
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn provider(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        match self.next_step(request) {
            Step::Reply(result) => result,
            Step::Hang => std::future::pending().await,
            _ => panic!("expected a reply step for chat()"),
        }
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        match self.next_step(request) {
            Step::Stream { chunks, hang_after } => {
                let replay = stream::iter(chunks);
                if hang_after {
                    Ok(replay.chain(stream::pending()).boxed())
                } else {
                    Ok(replay.boxed())
                }
            }
            Step::Paced { chunks, gap } => {
                let paced = stream::iter(chunks).then(move |chunk| async move {
                    tokio::time::sleep(gap).await;
                    chunk
                });
                Ok(paced.boxed())
            }
            Step::RejectStream(error) => Err(error),
            Step::Hang => std::future::pending().await,
            Step::Reply(_) => panic!("expected a stream step for chat_stream()"),
        }
    }
}
