//! Span recording for instrumented calls.
//!
//! A [`SpanRecorder`] opens spans and hands out an [`ActiveSpan`] guard. The
//! guard is the only way to mutate an open span, and closing it consumes the
//! guard, so a span is closed exactly once and is immutable afterwards. A guard
//! dropped without [`ActiveSpan::end`] closes its span as
//! [`SpanStatus::Cancelled`].
//!
//! Closed spans are handed to the [`Exporter`](super::Exporter) as
//! [`SpanRecord`]s.

use super::exporter::Exporter;
use crate::observability::TraceContext;
use opentelemetry::trace::{SpanId, TraceId};
use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Final status of a span.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SpanStatus {
    /// Closed without an explicit outcome.
    #[default]
    Unset,
    /// The operation succeeded.
    Ok,
    /// The operation failed.
    Error {
        /// Human-readable failure description.
        description: String,
    },
    /// The consumer abandoned the operation before it finished.
    Cancelled,
}

impl SpanStatus {
    /// Shorthand for an [`SpanStatus::Error`].
    #[must_use]
    pub fn error(description: impl Into<String>) -> Self {
        Self::Error {
            description: description.into(),
        }
    }
}

/// Exception attached to a failed span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRecord {
    /// Error category, e.g. `"timeout"`.
    pub exception_type: String,
    /// Error message.
    pub message: String,
    /// When the exception was recorded.
    pub timestamp: SystemTime,
}

/// A closed span, as handed to the exporter.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    /// Span name, e.g. `llm_chat_request`.
    pub name: String,
    /// Trace this span belongs to.
    pub trace_id: TraceId,
    /// Span id.
    pub span_id: SpanId,
    /// Enclosing span, if the span was opened inside an instrumented scope.
    pub parent_span_id: Option<SpanId>,
    /// Open time.
    pub start_time: SystemTime,
    /// Close time.
    pub end_time: SystemTime,
    /// Attributes in insertion order; keys are unique.
    pub attributes: Vec<KeyValue>,
    /// Final status.
    pub status: SpanStatus,
    /// Exception recorded on failure.
    pub exception: Option<ExceptionRecord>,
}

impl SpanRecord {
    /// Looks up an attribute by key.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    /// Time between open and close.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end_time
            .duration_since(self.start_time)
            .unwrap_or_default()
    }
}

/// Opens spans and forwards closed ones to the exporter.
///
/// Cheap to clone; clones share the open-span count and the exporter.
#[derive(Clone)]
pub struct SpanRecorder {
    exporter: Exporter,
    ids: Arc<RandomIdGenerator>,
    open: Arc<AtomicUsize>,
}

impl std::fmt::Debug for SpanRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanRecorder")
            .field("open_spans", &self.open_spans())
            .finish_non_exhaustive()
    }
}

impl SpanRecorder {
    pub(crate) fn new(exporter: Exporter) -> Self {
        Self {
            exporter,
            ids: Arc::new(RandomIdGenerator::default()),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Opens a span named `name`.
    ///
    /// When called inside a `tracing` span that carries an OpenTelemetry
    /// context, the new span joins that trace as a child; otherwise it starts a
    /// new trace.
    #[must_use]
    pub fn start(&self, name: &str) -> ActiveSpan {
        let (trace_id, parent_span_id) = match TraceContext::from_current() {
            Some(ctx) => (ctx.trace_id, Some(ctx.parent_span_id)),
            None => (self.ids.new_trace_id(), None),
        };

        let record = SpanRecord {
            name: name.to_string(),
            trace_id,
            span_id: self.ids.new_span_id(),
            parent_span_id,
            start_time: SystemTime::now(),
            end_time: SystemTime::UNIX_EPOCH,
            attributes: Vec::new(),
            status: SpanStatus::Unset,
            exception: None,
        };

        self.open.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(span = name, span_id = %format!("{:016x}", record.span_id), "span opened");

        ActiveSpan {
            record: Some(record),
            recorder: self.clone(),
        }
    }

    /// Number of spans opened but not yet closed.
    #[must_use]
    pub fn open_spans(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self, record: SpanRecord) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(
            span = %record.name,
            status = ?record.status,
            duration_ms = record.duration().as_millis(),
            "span closed"
        );
        self.exporter.submit(record);
    }
}

/// Guard over an open span.
///
/// Attributes may be set until the span is closed with [`ActiveSpan::end`].
/// Dropping the guard instead closes the span as [`SpanStatus::Cancelled`].
#[derive(Debug)]
pub struct ActiveSpan {
    record: Option<SpanRecord>,
    recorder: SpanRecorder,
}

impl ActiveSpan {
    /// Sets an attribute, replacing any earlier value under the same key.
    pub fn set_attribute(&mut self, attribute: KeyValue) {
        let Some(record) = self.record.as_mut() else {
            return;
        };
        if let Some(existing) = record
            .attributes
            .iter_mut()
            .find(|kv| kv.key == attribute.key)
        {
            existing.value = attribute.value;
        } else {
            record.attributes.push(attribute);
        }
    }

    /// Sets several attributes.
    pub fn set_attributes(&mut self, attributes: impl IntoIterator<Item = KeyValue>) {
        for attribute in attributes {
            self.set_attribute(attribute);
        }
    }

    /// Attaches an exception record; a later call replaces it.
    pub fn record_exception(&mut self, exception_type: &str, message: &str) {
        if let Some(record) = self.record.as_mut() {
            record.exception = Some(ExceptionRecord {
                exception_type: exception_type.to_string(),
                message: message.to_string(),
                timestamp: SystemTime::now(),
            });
        }
    }

    /// Trace id of this span.
    #[must_use]
    pub fn trace_id(&self) -> TraceId {
        self.record
            .as_ref()
            .map_or(TraceId::INVALID, |r| r.trace_id)
    }

    /// Id of this span.
    #[must_use]
    pub fn span_id(&self) -> SpanId {
        self.record.as_ref().map_or(SpanId::INVALID, |r| r.span_id)
    }

    /// Closes the span with `status`.
    pub fn end(mut self, status: SpanStatus) {
        self.finish(status);
    }

    fn finish(&mut self, status: SpanStatus) {
        if let Some(mut record) = self.record.take() {
            record.end_time = SystemTime::now().max(record.start_time);
            record.status = status;
            self.recorder.close(record);
        }
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        self.finish(SpanStatus::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{ExportSettings, MemorySink, Telemetry};

    fn telemetry() -> (Telemetry, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let telemetry = Telemetry::with_sink(sink.clone(), ExportSettings::immediate());
        (telemetry, sink)
    }

    #[tokio::test]
    async fn end_closes_with_given_status_and_attributes() {
        let (telemetry, sink) = telemetry();
        let recorder = telemetry.recorder();

        let mut span = recorder.start("work");
        span.set_attribute(KeyValue::new("llm.model", "m1"));
        span.set_attribute(KeyValue::new("llm.model", "m2"));
        assert_eq!(recorder.open_spans(), 1);
        span.end(SpanStatus::Ok);

        telemetry.flush().await.unwrap();
        let spans = sink.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, SpanStatus::Ok);
        assert_eq!(spans[0].attributes.len(), 1);
        assert_eq!(spans[0].attribute("llm.model"), Some(&Value::from("m2")));
        assert!(spans[0].end_time >= spans[0].start_time);
        assert_eq!(recorder.open_spans(), 0);
    }

    #[tokio::test]
    async fn dropped_guard_closes_as_cancelled() {
        let (telemetry, sink) = telemetry();
        drop(telemetry.recorder().start("abandoned"));

        telemetry.flush().await.unwrap();
        let spans = sink.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, SpanStatus::Cancelled);
        assert_eq!(telemetry.recorder().open_spans(), 0);
    }

    #[tokio::test]
    async fn spans_outside_a_trace_start_new_traces() {
        let (telemetry, _sink) = telemetry();
        let a = telemetry.recorder().start("a");
        let b = telemetry.recorder().start("b");
        assert_ne!(a.trace_id(), b.trace_id());
        assert_ne!(a.span_id(), SpanId::INVALID);
        a.end(SpanStatus::Ok);
        b.end(SpanStatus::Ok);
    }

    #[tokio::test]
    async fn exception_is_kept_on_the_record() {
        let (telemetry, sink) = telemetry();
        let mut span = telemetry.recorder().start("failing");
        span.record_exception("timeout", "timed out after 1s");
        span.end(SpanStatus::error("timed out after 1s"));

        telemetry.flush().await.unwrap();
        let exception = sink.spans()[0].exception.clone().unwrap();
        assert_eq!(exception.exception_type, "timeout");
        assert_eq!(exception.message, "timed out after 1s");
    }
}
