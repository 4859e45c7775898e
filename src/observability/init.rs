//! Diagnostics subscriber setup.
//!
//! Configures the process-wide `tracing` subscriber: an [`EnvFilter`], a
//! compact stderr formatter, and, when a diagnostics file is configured, an
//! OpenTelemetry layer whose spans are written to that file.

use super::tracer;
use crate::telemetry;
use crate::Config;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::TracerProvider;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive.
const DEFAULT_LEVEL: &str = "info";

/// Keeps the diagnostics pipeline alive; flushes pending spans on drop.
#[must_use = "dropping the guard flushes and detaches the diagnostics exporter"]
#[derive(Debug)]
pub struct TracingGuard {
    provider: Option<TracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            for result in provider.force_flush() {
                if let Err(e) = result {
                    eprintln!("failed to flush diagnostics spans: {e}");
                }
            }
        }
    }
}

/// Installs the global `tracing` subscriber.
///
/// # Filter Resolution
///
/// 1. `config.trace_level` (filled from `RUST_LOG` / `LLM_OBSERVE_LOG` by
///    [`Config::from_env`])
/// 2. Default: `"info"`
///
/// An unparsable directive falls back to the default.
///
/// # Diagnostics File
///
/// With `config.diagnostics_file` set, the crate's own `tracing` spans are
/// also exported as OTLP JSON lines to that file, and call spans recorded
/// inside them join their trace. If the file's directory cannot be created,
/// only the stderr output is installed.
///
/// Calling this more than once is harmless: only the first subscriber is kept.
///
/// # Example
///
/// ```no_run
/// use llm_observe::observability::init_tracing;
/// use llm_observe::Config;
///
/// let config = Config {
///     trace_level: Some("debug".to_string()),
///     ..Default::default()
/// };
///
/// let _guard = init_tracing(&config);
/// tracing::debug!("tracing is now active");
/// ```
pub fn init_tracing(config: &Config) -> TracingGuard {
    let level = config.trace_level.as_deref().unwrap_or(DEFAULT_LEVEL);
    let filter = EnvFilter::try_new(level).unwrap_or_else(|e| {
        eprintln!("invalid trace level `{level}` ({e}), using `{DEFAULT_LEVEL}`");
        EnvFilter::new(DEFAULT_LEVEL)
    });

    let provider = config.diagnostics_file.as_ref().and_then(|path| {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                eprintln!("diagnostics file disabled, cannot create {}: {e}", parent.display());
                return None;
            }
        }
        Some(tracer::create_tracer_provider(
            path.clone(),
            telemetry::resource(config),
        ))
    });

    let otel_layer = provider
        .as_ref()
        .map(|provider| {
            OpenTelemetryLayer::new(provider.tracer(telemetry::conventions::INSTRUMENTATION_SCOPE))
        });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(
            level,
            diagnostics_file = ?config.diagnostics_file,
            "diagnostics initialized"
        );
    }

    TracingGuard { provider }
}
