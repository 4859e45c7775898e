//! Interactive chat against an Ollama model with full telemetry.
//!
//! Reads user input line by line, runs each line as an instrumented turn and
//! prints the answer, followed by a one-line summary of the turn's metrics.
//!
//! # Usage
//!
//! ```text
//! llm-observe [CONFIG.toml]
//! ```
//!
//! Without a file, configuration comes from the environment (see
//! [`Config::from_env`]).
//!
//! # Commands
//!
//! - `quit` / `exit`: End the session
//! - `clear`: Forget the conversation
//! - `history`: Print the conversation
//! - `stream`: Toggle streamed answers
//!
//! Telemetry is flushed and the exporter shut down before the process exits,
//! whichever way the loop ends, Ctrl-C included. A turn interrupted by Ctrl-C
//! is recorded as cancelled.

#![allow(clippy::multiple_crate_versions)]

use futures_util::StreamExt;
use llm_observe::backend::{ModelBackend, OllamaBackend};
use llm_observe::instrument::{
    CallInstrumentor, InstrumentorConfig, StreamInstrumentor, TurnOutcome,
};
use llm_observe::observability::init_tracing;
use llm_observe::telemetry::conventions::METRIC_REQUESTS;
use llm_observe::{Config, Session, Telemetry};
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Quit,
    Clear,
    History,
    ToggleStream,
    Empty,
    Chat(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let trimmed = line.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" => Self::Empty,
            "quit" | "exit" => Self::Quit,
            "clear" => Self::Clear,
            "history" => Self::History,
            "stream" => Self::ToggleStream,
            _ => Self::Chat(trimmed),
        }
    }
}

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: cannot start the async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(run());
    // An interrupted stdin read is still parked on a blocking thread.
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> llm_observe::Result<Config> {
    let config = match std::env::args_os().nth(1) {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::from_env()?,
    };
    Ok(config)
}

async fn run() -> llm_observe::Result<()> {
    let config = load_config()?;
    let _tracing = init_tracing(&config);

    let telemetry = Telemetry::init(&config)?;
    let backend: Arc<dyn ModelBackend> = Arc::new(OllamaBackend::new(
        &config.backend_host,
        config.request_timeout_secs.map(Duration::from_secs),
    )?);

    let settings = InstrumentorConfig::from_config(&config);
    let chat = CallInstrumentor::new(Arc::clone(&backend), telemetry.clone(), settings.clone());
    let streamer = StreamInstrumentor::new(backend, telemetry.clone(), settings);

    let mut session = Session::new();
    let input = BufReader::new(tokio::io::stdin());
    let result = repl(&config, &chat, &streamer, &telemetry, &mut session, input, ctrl_c()).await;

    let summary = session.summary();
    println!();
    println!("Session summary");
    println!("  id:       {}", summary.session_id);
    println!("  started:  {}", session.created_at().to_rfc3339());
    println!("  turns:    {}", summary.turns);
    println!("  messages: {}", summary.total_messages);
    println!("  duration: {}s", summary.duration_secs);

    tracing::debug!(session_id = %summary.session_id, "flushing telemetry");
    telemetry.shutdown().await?;
    result
}

/// Resolves on the first Ctrl-C; never resolves if the handler can't be
/// installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Runs the chat loop until `quit`, end of input or `interrupt` resolves.
///
/// An interrupt during a turn drops the turn, which closes its span as
/// cancelled and rolls the history back.
async fn repl<R, I>(
    config: &Config,
    chat: &CallInstrumentor,
    streamer: &StreamInstrumentor,
    telemetry: &Telemetry,
    session: &mut Session,
    input: R,
    interrupt: I,
) -> llm_observe::Result<()>
where
    R: AsyncBufRead + Unpin,
    I: Future<Output = ()>,
{
    let mut stdout = tokio::io::stdout();
    let mut lines = input.lines();
    let mut streaming = false;
    tokio::pin!(interrupt);

    println!("llm-observe chat");
    println!("  model:     {}", config.model);
    println!("  backend:   {}", config.backend_host);
    println!("  telemetry: {} ({})", config.export_protocol, config.collector_endpoint);
    println!("  session:   {}", session.id());
    println!("Commands: quit, exit, clear, history, stream");
    println!();

    loop {
        stdout.write_all(b"You: ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            () = &mut interrupt => {
                println!();
                tracing::debug!("interrupted while waiting for input");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        match Command::parse(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Clear => {
                session.history_mut().clear();
                println!("Conversation cleared.");
            }
            Command::History => print_history(session),
            Command::ToggleStream => {
                streaming = !streaming;
                println!("Streaming {}.", if streaming { "on" } else { "off" });
            }
            Command::Chat(text) => {
                let turn = async {
                    if streaming {
                        stream_turn(streamer, session, text, &mut stdout).await
                    } else {
                        Ok(call_turn(chat, session, text).await)
                    }
                };
                let outcome = tokio::select! {
                    outcome = turn => outcome?,
                    () = &mut interrupt => {
                        println!();
                        println!("Interrupted, turn cancelled.");
                        break;
                    }
                };
                if let Some(outcome) = outcome {
                    print_turn_metrics(&outcome, telemetry, &config.model);
                }
            }
        }
    }

    Ok(())
}

async fn call_turn(
    chat: &CallInstrumentor,
    session: &mut Session,
    text: &str,
) -> Option<TurnOutcome> {
    match chat.execute(session, text).await {
        Ok(outcome) => {
            println!("Assistant: {}", outcome.content);
            Some(outcome)
        }
        Err(e) => {
            eprintln!("Request failed ({}): {e}", e.kind());
            None
        }
    }
}

async fn stream_turn(
    streamer: &StreamInstrumentor,
    session: &mut Session,
    text: &str,
    stdout: &mut Stdout,
) -> std::io::Result<Option<TurnOutcome>> {
    stdout.write_all(b"Assistant: ").await?;
    stdout.flush().await?;

    let mut stream = streamer.execute(session, text);
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                stdout.write_all(chunk.as_bytes()).await?;
                stdout.flush().await?;
            }
            Err(e) => {
                stdout.write_all(b"\n").await?;
                eprintln!("Stream failed ({}): {e}", e.kind());
            }
        }
    }
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;

    Ok(stream.outcome().cloned())
}

fn print_history(session: &Session) {
    if session.history().is_empty() {
        println!("(no messages)");
        return;
    }
    for (i, message) in session.history().iter().enumerate() {
        println!("{:>3}. {}: {}", i + 1, message.role(), message.content());
    }
}

fn print_turn_metrics(outcome: &TurnOutcome, telemetry: &Telemetry, model: &str) {
    let usage = outcome.usage.unwrap_or_default();
    let successes = telemetry
        .metrics()
        .counter(METRIC_REQUESTS, &[("model", model), ("status", "success")]);
    println!(
        "[metrics] tokens: prompt={} completion={} total={} | latency: {:.0} ms | successful requests: {successes}",
        usage.prompt_tokens,
        usage.completion_tokens,
        usage.total_tokens(),
        outcome.duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use llm_observe::backend::{ChatRequest, ChatResponse, ChunkStream};
    use llm_observe::telemetry::{ExportSettings, MemorySink, SpanStatus};
    use llm_observe::ProviderError;

    /// Backend that never answers.
    struct StalledBackend;

    #[async_trait]
    impl ModelBackend for StalledBackend {
        fn provider(&self) -> &str {
            "stalled"
        }

        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            std::future::pending().await
        }

        async fn chat_stream(&self, _request: ChatRequest) -> Result<ChunkStream, ProviderError> {
            std::future::pending().await
        }
    }

    #[test]
    fn parses_commands_case_insensitively() {
        assert_eq!(Command::parse("  QUIT "), Command::Quit);
        assert_eq!(Command::parse("exit"), Command::Quit);
        assert_eq!(Command::parse("Stream"), Command::ToggleStream);
        assert_eq!(Command::parse("   "), Command::Empty);
        assert_eq!(Command::parse(" hello there "), Command::Chat("hello there"));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_cancels_the_pending_turn_and_flushes_on_shutdown() {
        let sink = Arc::new(MemorySink::new());
        let telemetry = Telemetry::with_sink(sink.clone(), ExportSettings::default());
        let backend: Arc<dyn ModelBackend> = Arc::new(StalledBackend);
        let settings = InstrumentorConfig::new("m1");
        let chat = CallInstrumentor::new(Arc::clone(&backend), telemetry.clone(), settings.clone());
        let streamer = StreamInstrumentor::new(backend, telemetry.clone(), settings);
        let mut session = Session::with_id("s1");

        let input: &[u8] = b"hi\nstill typing\n";
        let interrupt = tokio::time::sleep(Duration::from_secs(1));
        repl(&Config::default(), &chat, &streamer, &telemetry, &mut session, input, interrupt)
            .await
            .unwrap();

        assert!(session.history().is_empty());
        assert_eq!(session.turn_count(), 1);
        assert_eq!(telemetry.recorder().open_spans(), 0);
        assert!(sink.spans().is_empty());

        telemetry.shutdown().await.unwrap();
        let spans = sink.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, SpanStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_while_streaming_cancels_the_turn() {
        let sink = Arc::new(MemorySink::new());
        let telemetry = Telemetry::with_sink(sink.clone(), ExportSettings::immediate());
        let backend: Arc<dyn ModelBackend> = Arc::new(StalledBackend);
        let settings = InstrumentorConfig::new("m1");
        let chat = CallInstrumentor::new(Arc::clone(&backend), telemetry.clone(), settings.clone());
        let streamer = StreamInstrumentor::new(backend, telemetry.clone(), settings);
        let mut session = Session::with_id("s1");

        let input: &[u8] = b"stream\nhi\n";
        let interrupt = tokio::time::sleep(Duration::from_secs(1));
        repl(&Config::default(), &chat, &streamer, &telemetry, &mut session, input, interrupt)
            .await
            .unwrap();

        telemetry.flush().await.unwrap();
        assert!(session.history().is_empty());
        let spans = sink.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "llm_chat_stream");
        assert_eq!(spans[0].status, SpanStatus::Cancelled);
    }
}
