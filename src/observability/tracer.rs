//! Tracer provider that writes the crate's own diagnostic spans to a file.
//!
//! Spans produced through `tracing-opentelemetry` are converted to
//! [`SpanRecord`]s and written with the same OTLP encoder and rotating writer
//! as the telemetry file sink, one `resourceSpans` document per line.

use crate::telemetry::file_writer::FileWriter;
use crate::telemetry::{OtlpEncoder, SpanRecord, SpanStatus};
use futures_util::future::BoxFuture;
use opentelemetry::trace::{SpanId, Status, TraceError};
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::TracerProvider;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// `SpanExporter` appending OTLP JSON lines to a rotating file.
struct FileSpanExporter {
    writer: FileWriter,
    encoder: OtlpEncoder,
    is_shutdown: AtomicBool,
}

impl FileSpanExporter {
    const fn new(file_path: PathBuf, resource: Resource) -> Self {
        Self {
            writer: FileWriter::new(file_path),
            encoder: OtlpEncoder::new(resource),
            is_shutdown: AtomicBool::new(false),
        }
    }

    fn write(&self, batch: &[SpanData]) -> ExportResult {
        let records: Vec<SpanRecord> = batch.iter().map(to_record).collect();
        let line = self.encoder.encode_spans(&records).to_string();
        self.writer
            .write_line(&line)
            .map_err(|e| TraceError::from(e.to_string()))
    }
}

impl SpanExporter for FileSpanExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let result = if self.is_shutdown.load(Ordering::SeqCst) {
            Err(TraceError::from("diagnostics exporter is shut down"))
        } else {
            self.write(&batch)
        };
        Box::pin(std::future::ready(result))
    }

    fn shutdown(&mut self) {
        self.is_shutdown.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for FileSpanExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSpanExporter")
            .field("writer", &self.writer)
            .field("is_shutdown", &self.is_shutdown)
            .finish_non_exhaustive()
    }
}

fn to_record(span: &SpanData) -> SpanRecord {
    SpanRecord {
        name: span.name.to_string(),
        trace_id: span.span_context.trace_id(),
        span_id: span.span_context.span_id(),
        parent_span_id: (span.parent_span_id != SpanId::INVALID).then_some(span.parent_span_id),
        start_time: span.start_time,
        end_time: span.end_time,
        attributes: span.attributes.clone(),
        status: match &span.status {
            Status::Unset => SpanStatus::Unset,
            Status::Ok => SpanStatus::Ok,
            Status::Error { description } => SpanStatus::error(description.to_string()),
        },
        exception: None,
    }
}

/// Creates a tracer provider exporting every finished span to `file_path`
/// as soon as it ends.
pub fn create_tracer_provider(file_path: PathBuf, resource: Resource) -> TracerProvider {
    let exporter = FileSpanExporter::new(file_path, resource.clone());

    TracerProvider::builder()
        .with_config(opentelemetry_sdk::trace::Config::default().with_resource(resource))
        .with_simple_exporter(exporter)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{Span as _, Tracer as _, TracerProvider as _};
    use opentelemetry::KeyValue;

    #[test]
    fn finished_spans_land_in_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diagnostics.json");
        let provider = create_tracer_provider(
            path.clone(),
            Resource::new(vec![KeyValue::new("service.name", "diag")]),
        );

        let tracer = provider.tracer("test");
        let mut span = tracer.start("startup");
        span.set_attribute(KeyValue::new("step", "config"));
        span.end();

        let content = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        let exported = &doc["resourceSpans"][0]["scopeSpans"][0]["spans"][0];
        assert_eq!(exported["name"], "startup");
        assert_eq!(exported["attributes"][0]["key"], "step");
    }
}
