//! Spans, metrics and their export.
//!
//! A [`Telemetry`] context bundles the three pieces every instrumented call
//! needs:
//!
//! ```text
//! SpanRecorder ──closed spans──▶ Exporter task ──▶ TelemetrySink ──▶ collector
//! MetricsRegistry ──samples──────────┘
//! ```
//!
//! The context is built once at startup, cloned into every instrumentor, and
//! shut down explicitly so that buffered telemetry is flushed before exit.
//! There is no global state: two contexts never share spans or metrics.
//!
//! # Example
//!
//! ```no_run
//! use llm_observe::telemetry::{ExportSettings, MemorySink, Telemetry};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), llm_observe::TelemetryError> {
//! let sink = Arc::new(MemorySink::new());
//! let telemetry = Telemetry::with_sink(sink.clone(), ExportSettings::immediate());
//!
//! telemetry.metrics().increment_requests("llama3.1:8b", "success");
//! telemetry.shutdown().await?;
//! assert_eq!(sink.metrics().len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`conventions`]: Metric, span and attribute names
//! - [`span`]: Span recorder and close-once guard
//! - [`metrics`]: Metrics registry
//! - [`exporter`]: Background export task
//! - [`sink`]: Transports
//! - [`otlp`]: OTLP/JSON encoding
//! - [`file_writer`]: Rotating JSON-lines writer

pub mod conventions;
pub mod exporter;
pub mod file_writer;
pub mod metrics;
pub mod otlp;
pub mod sink;
pub mod span;

pub use exporter::{ExportSettings, Exporter};
pub use metrics::{
    HistogramSummary, Labels, MetricKind, MetricSample, MetricValue, MetricsRegistry,
    MetricsSnapshot,
};
pub use otlp::OtlpEncoder;
pub use sink::{ConsoleSink, FileSink, MemorySink, NoopSink, OtlpHttpSink, TelemetrySink};
pub use span::{ActiveSpan, ExceptionRecord, SpanRecord, SpanRecorder, SpanStatus};

use crate::domain::{ConfigError, TelemetryError};
use crate::Config;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Where exported telemetry goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportProtocol {
    /// OTLP/HTTP with JSON bodies.
    #[default]
    HttpJson,
    /// Rotating OTLP JSON-lines file.
    File,
    /// OTLP JSON lines on stderr.
    Console,
    /// Export disabled.
    None,
}

impl ExportProtocol {
    /// Configuration spelling of this protocol.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HttpJson => "http/json",
            Self::File => "file",
            Self::Console => "console",
            Self::None => "none",
        }
    }
}

impl fmt::Display for ExportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http/json" | "http" | "otlp" => Ok(Self::HttpJson),
            "file" => Ok(Self::File),
            "console" | "stdout" | "stderr" => Ok(Self::Console),
            "none" | "off" | "disabled" => Ok(Self::None),
            "grpc" | "http/protobuf" => Err(ConfigError::invalid(
                "export_protocol",
                format!("`{s}` is not supported, use `http/json`"),
            )),
            other => Err(ConfigError::invalid(
                "export_protocol",
                format!("unknown protocol `{other}`"),
            )),
        }
    }
}

/// Shared handle to the span recorder, the metrics registry and the exporter.
///
/// Cheap to clone; clones share all state.
#[derive(Clone, Debug)]
pub struct Telemetry {
    recorder: SpanRecorder,
    metrics: MetricsRegistry,
    exporter: Exporter,
}

impl Telemetry {
    /// Builds the sink described by `config` and starts the exporter.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the collector endpoint is invalid.
    pub fn init(config: &Config) -> Result<Self, ConfigError> {
        let encoder = OtlpEncoder::new(resource(config));

        let sink: Arc<dyn TelemetrySink> = match config.export_protocol {
            ExportProtocol::HttpJson => {
                Arc::new(OtlpHttpSink::new(&config.collector_endpoint, encoder)?)
            }
            ExportProtocol::File => Arc::new(FileSink::new(config.telemetry_file_path(), encoder)),
            ExportProtocol::Console => Arc::new(ConsoleSink::new(encoder)),
            ExportProtocol::None => Arc::new(NoopSink),
        };

        tracing::debug!(
            protocol = %config.export_protocol,
            endpoint = %config.collector_endpoint,
            flush_interval_ms = config.flush_interval_ms,
            "telemetry initialized"
        );

        Ok(Self::with_sink(
            sink,
            ExportSettings::every(Duration::from_millis(config.flush_interval_ms)),
        ))
    }

    /// Starts an exporter over an explicit sink.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn with_sink(sink: Arc<dyn TelemetrySink>, settings: ExportSettings) -> Self {
        let metrics = MetricsRegistry::new();
        let exporter = Exporter::spawn(sink, metrics.clone(), settings);
        let recorder = SpanRecorder::new(exporter.clone());
        Self {
            recorder,
            metrics,
            exporter,
        }
    }

    /// Span recorder.
    #[must_use]
    pub const fn recorder(&self) -> &SpanRecorder {
        &self.recorder
    }

    /// Metrics registry.
    #[must_use]
    pub const fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Waits until everything recorded so far has reached the sink.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ShutDown`] after [`Telemetry::shutdown`].
    pub async fn flush(&self) -> Result<(), TelemetryError> {
        self.exporter.flush().await
    }

    /// Flushes and stops the exporter; later spans are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ShutDown`] if already shut down.
    pub async fn shutdown(&self) -> Result<(), TelemetryError> {
        self.exporter.shutdown().await
    }
}

/// Resource attributes stamped on every exported document.
#[must_use]
pub fn resource(config: &Config) -> Resource {
    let mut attributes = vec![
        KeyValue::new(conventions::RESOURCE_SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(conventions::RESOURCE_SERVICE_VERSION, config.service_version.clone()),
        KeyValue::new(conventions::RESOURCE_ENVIRONMENT, config.environment.clone()),
    ];
    if let Some(project) = &config.project_name {
        attributes.push(KeyValue::new(conventions::RESOURCE_PROJECT, project.clone()));
    }
    if let Some(workspace) = &config.workspace {
        attributes.push(KeyValue::new(conventions::RESOURCE_WORKSPACE, workspace.clone()));
    }
    Resource::new(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parsing() {
        assert_eq!("http/json".parse::<ExportProtocol>().unwrap(), ExportProtocol::HttpJson);
        assert_eq!(" FILE ".parse::<ExportProtocol>().unwrap(), ExportProtocol::File);
        assert!(matches!(
            "grpc".parse::<ExportProtocol>(),
            Err(ConfigError::Invalid { ref reason, .. }) if reason.contains("not supported")
        ));
        assert!("carrier-pigeon".parse::<ExportProtocol>().is_err());
    }

    #[test]
    fn resource_includes_optional_project_labels() {
        let config = Config {
            project_name: Some("demo".to_string()),
            ..Config::default()
        };
        let resource = resource(&config);
        let keys: Vec<String> = resource.iter().map(|(k, _)| k.to_string()).collect();
        assert!(keys.contains(&"service.name".to_string()));
        assert!(keys.contains(&"telemetry.project".to_string()));
        assert!(!keys.contains(&"telemetry.workspace".to_string()));
    }

    #[tokio::test]
    async fn init_rejects_invalid_collector_endpoint() {
        let config = Config {
            collector_endpoint: "localhost:4318 ".to_string(),
            ..Config::default()
        };
        assert!(Telemetry::init(&config).is_err());
    }

    #[tokio::test]
    async fn init_with_disabled_export_still_records() {
        let config = Config {
            export_protocol: ExportProtocol::None,
            ..Config::default()
        };
        let telemetry = Telemetry::init(&config).unwrap();
        telemetry.metrics().increment_requests("m1", "success");
        telemetry.shutdown().await.unwrap();
        assert_eq!(
            telemetry
                .metrics()
                .counter(conventions::METRIC_REQUESTS, &[("model", "m1"), ("status", "success")]),
            1
        );
    }
}
