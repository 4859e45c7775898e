//! Telemetry transports.
//!
//! A [`TelemetrySink`] receives batches of closed spans and metric samples from
//! the exporter task. Sink errors are reported to the exporter, which logs and
//! drops the batch; they never reach the instrumented call.
//!
//! # Implementations
//!
//! - [`OtlpHttpSink`]: OTLP/HTTP with JSON bodies
//! - [`FileSink`]: rotating OTLP JSON-lines file
//! - [`ConsoleSink`]: OTLP JSON lines on stderr
//! - [`MemorySink`]: keeps everything in memory for inspection
//! - [`NoopSink`]: discards everything

use super::file_writer::FileWriter;
use super::metrics::MetricSample;
use super::otlp::OtlpEncoder;
use super::span::SpanRecord;
use crate::domain::{ConfigError, TelemetryError};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value as JsonValue;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Destination for exported telemetry.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Exports a batch of closed spans.
    ///
    /// # Errors
    ///
    /// Returns a [`TelemetryError`] if the batch could not be delivered.
    async fn export_spans(&self, spans: &[SpanRecord]) -> Result<(), TelemetryError>;

    /// Exports a batch of metric samples.
    ///
    /// # Errors
    ///
    /// Returns a [`TelemetryError`] if the batch could not be delivered.
    async fn export_metrics(&self, samples: &[MetricSample]) -> Result<(), TelemetryError>;

    /// Releases transport resources after the final export.
    ///
    /// # Errors
    ///
    /// Returns a [`TelemetryError`] if the transport could not be closed cleanly.
    async fn shutdown(&self) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Posts OTLP JSON documents to a collector's `/v1/traces` and `/v1/metrics`.
#[derive(Debug)]
pub struct OtlpHttpSink {
    client: Client,
    traces_url: Url,
    metrics_url: Url,
    encoder: OtlpEncoder,
}

impl OtlpHttpSink {
    /// Per-request timeout for collector calls.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a sink for the collector at `endpoint` (e.g. `http://localhost:4318`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `endpoint` is not an http(s) URL.
    pub fn new(endpoint: &str, encoder: OtlpEncoder) -> Result<Self, ConfigError> {
        let trimmed = endpoint.trim().trim_end_matches('/');
        let base = Url::parse(&format!("{trimmed}/"))
            .map_err(|e| ConfigError::invalid("collector_endpoint", e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "collector_endpoint",
                format!("unsupported scheme `{}`", base.scheme()),
            ));
        }

        let join = |path: &str| {
            base.join(path)
                .map_err(|e| ConfigError::invalid("collector_endpoint", e.to_string()))
        };
        let traces_url = join("v1/traces")?;
        let metrics_url = join("v1/metrics")?;

        let client = Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                ConfigError::invalid(
                    "collector_endpoint",
                    format!("failed to build HTTP client: {e}"),
                )
            })?;

        Ok(Self {
            client,
            traces_url,
            metrics_url,
            encoder,
        })
    }

    /// URL spans are posted to.
    #[must_use]
    pub const fn traces_url(&self) -> &Url {
        &self.traces_url
    }

    /// URL metrics are posted to.
    #[must_use]
    pub const fn metrics_url(&self) -> &Url {
        &self.metrics_url
    }

    async fn post(&self, url: &Url, document: &JsonValue) -> Result<(), TelemetryError> {
        let response = self
            .client
            .post(url.clone())
            .json(document)
            .send()
            .await
            .map_err(|e| TelemetryError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(TelemetryError::Transport(format!(
                "collector at {url} returned {status}: {body}"
            )))
        }
    }
}

#[async_trait]
impl TelemetrySink for OtlpHttpSink {
    async fn export_spans(&self, spans: &[SpanRecord]) -> Result<(), TelemetryError> {
        let document = self.encoder.encode_spans(spans);
        self.post(&self.traces_url, &document).await
    }

    async fn export_metrics(&self, samples: &[MetricSample]) -> Result<(), TelemetryError> {
        let document = self.encoder.encode_metrics(samples);
        self.post(&self.metrics_url, &document).await
    }
}

/// Appends one OTLP JSON document per export to a rotating file.
#[derive(Debug)]
pub struct FileSink {
    writer: FileWriter,
    encoder: OtlpEncoder,
}

impl FileSink {
    /// Creates a sink writing to `path`.
    #[must_use]
    pub const fn new(path: PathBuf, encoder: OtlpEncoder) -> Self {
        Self {
            writer: FileWriter::new(path),
            encoder,
        }
    }
}

#[async_trait]
impl TelemetrySink for FileSink {
    async fn export_spans(&self, spans: &[SpanRecord]) -> Result<(), TelemetryError> {
        let line = serde_json::to_string(&self.encoder.encode_spans(spans))?;
        self.writer.write_line(&line)?;
        Ok(())
    }

    async fn export_metrics(&self, samples: &[MetricSample]) -> Result<(), TelemetryError> {
        let line = serde_json::to_string(&self.encoder.encode_metrics(samples))?;
        self.writer.write_line(&line)?;
        Ok(())
    }
}

/// Prints one OTLP JSON document per export on stderr.
#[derive(Debug)]
pub struct ConsoleSink {
    encoder: OtlpEncoder,
}

impl ConsoleSink {
    /// Creates a console sink.
    #[must_use]
    pub const fn new(encoder: OtlpEncoder) -> Self {
        Self { encoder }
    }

    fn print(document: &JsonValue) -> Result<(), TelemetryError> {
        let line = serde_json::to_string(document)?;
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "{line}")?;
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for ConsoleSink {
    async fn export_spans(&self, spans: &[SpanRecord]) -> Result<(), TelemetryError> {
        Self::print(&self.encoder.encode_spans(spans))
    }

    async fn export_metrics(&self, samples: &[MetricSample]) -> Result<(), TelemetryError> {
        Self::print(&self.encoder.encode_metrics(samples))
    }
}

/// Keeps every exported span and sample in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    spans: Mutex<Vec<SpanRecord>>,
    metrics: Mutex<Vec<MetricSample>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every span exported so far, in export order.
    #[must_use]
    pub fn spans(&self) -> Vec<SpanRecord> {
        lock(&self.spans).clone()
    }

    /// Every metric sample exported so far, in export order.
    #[must_use]
    pub fn metrics(&self) -> Vec<MetricSample> {
        lock(&self.metrics).clone()
    }

    /// Forgets everything exported so far.
    pub fn clear(&self) {
        lock(&self.spans).clear();
        lock(&self.metrics).clear();
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn export_spans(&self, spans: &[SpanRecord]) -> Result<(), TelemetryError> {
        lock(&self.spans).extend_from_slice(spans);
        Ok(())
    }

    async fn export_metrics(&self, samples: &[MetricSample]) -> Result<(), TelemetryError> {
        lock(&self.metrics).extend_from_slice(samples);
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl TelemetrySink for NoopSink {
    async fn export_spans(&self, _spans: &[SpanRecord]) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn export_metrics(&self, _samples: &[MetricSample]) -> Result<(), TelemetryError> {
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MetricsRegistry;
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::Resource;

    fn encoder() -> OtlpEncoder {
        OtlpEncoder::new(Resource::new(vec![KeyValue::new("service.name", "chatbot")]))
    }

    #[test]
    fn http_sink_derives_signal_urls() {
        let sink = OtlpHttpSink::new("http://localhost:4318/", encoder()).unwrap();
        assert_eq!(sink.traces_url().as_str(), "http://localhost:4318/v1/traces");
        assert_eq!(sink.metrics_url().as_str(), "http://localhost:4318/v1/metrics");
    }

    #[test]
    fn http_sink_rejects_bad_endpoint() {
        assert!(OtlpHttpSink::new("not a url", encoder()).is_err());
        assert!(OtlpHttpSink::new("grpc://localhost:4317", encoder()).is_err());
    }

    #[tokio::test]
    async fn file_sink_writes_one_document_per_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.json");
        let sink = FileSink::new(path.clone(), encoder());

        let registry = MetricsRegistry::new();
        registry.increment_requests("m1", "success");
        sink.export_metrics(&registry.drain_samples()).await.unwrap();
        sink.export_spans(&[]).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let metrics: JsonValue = serde_json::from_str(lines[0]).unwrap();
        assert!(metrics.get("resourceMetrics").is_some());
        let spans: JsonValue = serde_json::from_str(lines[1]).unwrap();
        assert!(spans.get("resourceSpans").is_some());
    }

    #[tokio::test]
    async fn memory_sink_accumulates_and_clears() {
        let sink = MemorySink::new();
        let registry = MetricsRegistry::new();
        registry.increment_errors("m1", "timeout");
        sink.export_metrics(&registry.drain_samples()).await.unwrap();
        assert_eq!(sink.metrics().len(), 1);
        sink.clear();
        assert!(sink.metrics().is_empty());
    }
}
