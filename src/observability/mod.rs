//! The crate's own diagnostics.
//!
//! Everything in the crate logs through `tracing` macros. This module installs
//! the subscriber and links the two kinds of spans the crate deals with:
//!
//! ```text
//! tracing macros ─▶ EnvFilter ─▶ fmt layer (stderr)
//!                             └▶ OpenTelemetry layer ─▶ FileSpanExporter ─▶ diagnostics file
//! ```
//!
//! Call spans recorded by [`crate::telemetry::SpanRecorder`] are separate from
//! these, but join the trace of the enclosing diagnostic span through
//! [`TraceContext`].
//!
//! # Configuration
//!
//! Level is controlled by `config.trace_level` (`RUST_LOG` or
//! `LLM_OBSERVE_LOG`), default `"info"`. The diagnostics file is off unless
//! `config.diagnostics_file` is set.
//!
//! # Modules
//!
//! - [`init`]: Subscriber setup
//! - `tracer`: Tracer provider with file export
//! - `context`: Trace correlation

mod context;
pub mod init;
mod tracer;

pub use context::TraceContext;
pub use init::{init_tracing, TracingGuard};
