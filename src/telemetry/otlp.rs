//! OTLP/JSON encoding of spans and metric samples.
//!
//! Produces the documents accepted by an OTLP/HTTP collector on `/v1/traces`
//! (`resourceSpans`) and `/v1/metrics` (`resourceMetrics`). The same documents
//! are written one per line by the file and console sinks.

use super::conventions::{
    ATTR_EXCEPTION_MESSAGE, ATTR_EXCEPTION_TYPE, DURATION_UNIT, EVENT_EXCEPTION,
    INSTRUMENTATION_SCOPE, METRIC_DURATION, METRIC_ERRORS, METRIC_REQUESTS, METRIC_TOKENS,
};
use super::metrics::{Labels, MetricSample, MetricValue, LATENCY_BUCKET_BOUNDS};
use super::span::{SpanRecord, SpanStatus};
use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::Resource;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// Delta aggregation temporality.
const TEMPORALITY_DELTA: u8 = 1;

/// OTLP span kind `CLIENT`; every recorded span wraps an outbound call.
const SPAN_KIND_CLIENT: u8 = 3;

/// Encoder bound to one resource.
#[derive(Clone)]
pub struct OtlpEncoder {
    resource: Resource,
}

impl std::fmt::Debug for OtlpEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtlpEncoder").finish_non_exhaustive()
    }
}

impl OtlpEncoder {
    /// Creates an encoder that stamps every document with `resource`.
    #[must_use]
    pub const fn new(resource: Resource) -> Self {
        Self { resource }
    }

    /// Encodes spans as an `ExportTraceServiceRequest`.
    ///
    /// ```json
    /// {
    ///   "resourceSpans": [{
    ///     "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "chatbot"}}]},
    ///     "scopeSpans": [{"scope": {"name": "llm-observe"}, "spans": [...]}]
    ///   }]
    /// }
    /// ```
    #[must_use]
    pub fn encode_spans(&self, spans: &[SpanRecord]) -> JsonValue {
        let spans_json: Vec<JsonValue> = spans.iter().map(encode_span).collect();

        json!({
            "resourceSpans": [{
                "resource": { "attributes": self.resource_attributes() },
                "scopeSpans": [{
                    "scope": scope(),
                    "spans": spans_json,
                }]
            }]
        })
    }

    /// Encodes samples as an `ExportMetricsServiceRequest`.
    ///
    /// Samples of the same series are folded into one data point: counters
    /// become a delta, monotonic `sum`; latencies become a delta `histogram`
    /// over [`LATENCY_BUCKET_BOUNDS`].
    #[must_use]
    pub fn encode_metrics(&self, samples: &[MetricSample]) -> JsonValue {
        let mut counters: BTreeMap<&str, BTreeMap<&Labels, CounterPoint>> = BTreeMap::new();
        let mut histograms: BTreeMap<&str, BTreeMap<&Labels, HistogramPoint>> = BTreeMap::new();

        for sample in samples {
            match sample.value {
                MetricValue::Counter(delta) => counters
                    .entry(sample.name.as_str())
                    .or_default()
                    .entry(&sample.labels)
                    .or_insert_with(|| CounterPoint::new(sample.timestamp))
                    .add(delta, sample.timestamp),
                MetricValue::Histogram(value) => histograms
                    .entry(sample.name.as_str())
                    .or_default()
                    .entry(&sample.labels)
                    .or_insert_with(|| HistogramPoint::new(sample.timestamp))
                    .observe(value, sample.timestamp),
            }
        }

        let mut metrics: Vec<JsonValue> = Vec::new();

        for (name, series) in &counters {
            let points: Vec<JsonValue> = series
                .iter()
                .map(|(labels, point)| {
                    json!({
                        "attributes": encode_labels(labels),
                        "startTimeUnixNano": unix_nanos(point.start),
                        "timeUnixNano": unix_nanos(point.end),
                        "asInt": point.total.to_string(),
                    })
                })
                .collect();
            metrics.push(json!({
                "name": name,
                "description": describe(name),
                "unit": "1",
                "sum": {
                    "aggregationTemporality": TEMPORALITY_DELTA,
                    "isMonotonic": true,
                    "dataPoints": points,
                }
            }));
        }

        for (name, series) in &histograms {
            let points: Vec<JsonValue> = series
                .iter()
                .map(|(labels, point)| {
                    json!({
                        "attributes": encode_labels(labels),
                        "startTimeUnixNano": unix_nanos(point.start),
                        "timeUnixNano": unix_nanos(point.end),
                        "count": point.count.to_string(),
                        "sum": point.sum,
                        "min": point.min,
                        "max": point.max,
                        "bucketCounts": point
                            .buckets
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>(),
                        "explicitBounds": LATENCY_BUCKET_BOUNDS,
                    })
                })
                .collect();
            let unit = if *name == METRIC_DURATION { DURATION_UNIT } else { "1" };
            metrics.push(json!({
                "name": name,
                "description": describe(name),
                "unit": unit,
                "histogram": {
                    "aggregationTemporality": TEMPORALITY_DELTA,
                    "dataPoints": points,
                }
            }));
        }

        json!({
            "resourceMetrics": [{
                "resource": { "attributes": self.resource_attributes() },
                "scopeMetrics": [{
                    "scope": scope(),
                    "metrics": metrics,
                }]
            }]
        })
    }

    fn resource_attributes(&self) -> Vec<JsonValue> {
        self.resource
            .iter()
            .map(|(k, v)| {
                json!({
                    "key": k.to_string(),
                    "value": encode_value(v),
                })
            })
            .collect()
    }
}

struct CounterPoint {
    start: SystemTime,
    end: SystemTime,
    total: u64,
}

impl CounterPoint {
    const fn new(at: SystemTime) -> Self {
        Self {
            start: at,
            end: at,
            total: 0,
        }
    }

    fn add(&mut self, delta: u64, at: SystemTime) {
        self.total = self.total.saturating_add(delta);
        self.start = self.start.min(at);
        self.end = self.end.max(at);
    }
}

struct HistogramPoint {
    start: SystemTime,
    end: SystemTime,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    buckets: [u64; LATENCY_BUCKET_BOUNDS.len() + 1],
}

impl HistogramPoint {
    const fn new(at: SystemTime) -> Self {
        Self {
            start: at,
            end: at,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            buckets: [0; LATENCY_BUCKET_BOUNDS.len() + 1],
        }
    }

    fn observe(&mut self, value: f64, at: SystemTime) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.start = self.start.min(at);
        self.end = self.end.max(at);

        let bucket = LATENCY_BUCKET_BOUNDS
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(LATENCY_BUCKET_BOUNDS.len());
        self.buckets[bucket] += 1;
    }
}

fn scope() -> JsonValue {
    json!({
        "name": INSTRUMENTATION_SCOPE,
        "version": env!("CARGO_PKG_VERSION"),
    })
}

fn describe(metric: &str) -> &'static str {
    match metric {
        METRIC_REQUESTS => "Total number of LLM requests",
        METRIC_TOKENS => "Total number of tokens used",
        METRIC_DURATION => "LLM request duration in milliseconds",
        METRIC_ERRORS => "Total number of LLM errors",
        _ => "",
    }
}

fn encode_span(span: &SpanRecord) -> JsonValue {
    let (status_code, status_message) = encode_status(&span.status);

    let events: Vec<JsonValue> = span
        .exception
        .iter()
        .map(|exception| {
            json!({
                "timeUnixNano": unix_nanos(exception.timestamp),
                "name": EVENT_EXCEPTION,
                "attributes": encode_attributes(&[
                    KeyValue::new(ATTR_EXCEPTION_TYPE, exception.exception_type.clone()),
                    KeyValue::new(ATTR_EXCEPTION_MESSAGE, exception.message.clone()),
                ]),
            })
        })
        .collect();

    json!({
        "traceId": format!("{:032x}", span.trace_id),
        "spanId": format!("{:016x}", span.span_id),
        "parentSpanId": span
            .parent_span_id
            .map(|id| format!("{id:016x}"))
            .unwrap_or_default(),
        "name": span.name,
        "kind": SPAN_KIND_CLIENT,
        "startTimeUnixNano": unix_nanos(span.start_time),
        "endTimeUnixNano": unix_nanos(span.end_time),
        "attributes": encode_attributes(&span.attributes),
        "events": events,
        "status": {
            "code": status_code,
            "message": status_message,
        },
    })
}

/// OTLP status code and message; cancellation is reported as an error.
fn encode_status(status: &SpanStatus) -> (u8, String) {
    match status {
        SpanStatus::Unset => (0, String::new()),
        SpanStatus::Ok => (1, String::new()),
        SpanStatus::Error { description } => (2, description.clone()),
        SpanStatus::Cancelled => (2, "cancelled".to_string()),
    }
}

pub(crate) fn encode_attributes(attributes: &[KeyValue]) -> Vec<JsonValue> {
    attributes
        .iter()
        .map(|kv| {
            json!({
                "key": kv.key.to_string(),
                "value": encode_value(&kv.value),
            })
        })
        .collect()
}

fn encode_labels(labels: &Labels) -> Vec<JsonValue> {
    labels
        .iter()
        .map(|(k, v)| json!({ "key": k, "value": { "stringValue": v } }))
        .collect()
}

/// Maps an attribute value to its OTLP `AnyValue` form; 64-bit integers are
/// strings, as the JSON mapping requires.
fn encode_value(value: &Value) -> JsonValue {
    match value {
        Value::Bool(b) => json!({ "boolValue": b }),
        Value::I64(i) => json!({ "intValue": i.to_string() }),
        Value::F64(f) => json!({ "doubleValue": f }),
        Value::String(s) => json!({ "stringValue": s.as_str() }),
        Value::Array(_) => json!({ "stringValue": value.to_string() }),
    }
}

fn unix_nanos(time: SystemTime) -> String {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::span::ExceptionRecord;
    use opentelemetry::trace::{SpanId, TraceId};

    fn encoder() -> OtlpEncoder {
        OtlpEncoder::new(Resource::new(vec![KeyValue::new("service.name", "chatbot")]))
    }

    fn span(status: SpanStatus) -> SpanRecord {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        SpanRecord {
            name: "llm_chat_request".to_string(),
            trace_id: TraceId::from_bytes(0xabc_u128.to_be_bytes()),
            span_id: SpanId::from_bytes(0x12_u64.to_be_bytes()),
            parent_span_id: None,
            start_time: start,
            end_time: start + Duration::from_millis(250),
            attributes: vec![
                KeyValue::new("llm.model", "m1"),
                KeyValue::new("llm.total_tokens", 4_i64),
                KeyValue::new("llm.streaming", false),
            ],
            status,
            exception: None,
        }
    }

    #[test]
    fn span_document_has_ids_times_and_typed_attributes() {
        let doc = encoder().encode_spans(&[span(SpanStatus::Ok)]);

        let resource = &doc["resourceSpans"][0]["resource"]["attributes"][0];
        assert_eq!(resource["value"]["stringValue"], "chatbot");

        let encoded = &doc["resourceSpans"][0]["scopeSpans"][0]["spans"][0];
        assert_eq!(encoded["traceId"], format!("{:032x}", 0xabc));
        assert_eq!(encoded["spanId"], "0000000000000012");
        assert_eq!(encoded["parentSpanId"], "");
        assert_eq!(encoded["startTimeUnixNano"], "10000000000");
        assert_eq!(encoded["endTimeUnixNano"], "10250000000");
        assert_eq!(encoded["attributes"][1]["value"]["intValue"], "4");
        assert_eq!(encoded["attributes"][2]["value"]["boolValue"], false);
        assert_eq!(encoded["status"]["code"], 1);
    }

    #[test]
    fn cancelled_and_failed_spans_map_to_error_status() {
        let mut failed = span(SpanStatus::error("boom"));
        failed.exception = Some(ExceptionRecord {
            exception_type: "transport".to_string(),
            message: "boom".to_string(),
            timestamp: SystemTime::UNIX_EPOCH,
        });
        let doc = encoder().encode_spans(&[failed, span(SpanStatus::Cancelled)]);
        let spans = &doc["resourceSpans"][0]["scopeSpans"][0]["spans"];

        assert_eq!(spans[0]["status"]["code"], 2);
        assert_eq!(spans[0]["status"]["message"], "boom");
        assert_eq!(spans[0]["events"][0]["name"], "exception");
        assert_eq!(spans[0]["events"][0]["attributes"][0]["value"]["stringValue"], "transport");
        assert_eq!(spans[1]["status"]["code"], 2);
        assert_eq!(spans[1]["status"]["message"], "cancelled");
    }

    #[test]
    fn counter_samples_of_one_series_fold_into_one_point() {
        let registry = crate::telemetry::MetricsRegistry::new();
        registry.increment_requests("m1", "success");
        registry.increment_requests("m1", "success");
        registry.increment_requests("m1", "error");
        registry.observe_latency("m1", 7.0);
        registry.observe_latency("m1", 20_000.0);

        let doc = encoder().encode_metrics(&registry.drain_samples());
        let metrics = doc["resourceMetrics"][0]["scopeMetrics"][0]["metrics"]
            .as_array()
            .unwrap();
        assert_eq!(metrics.len(), 2);

        let requests = &metrics[0];
        assert_eq!(requests["name"], "llm.requests.total");
        assert_eq!(requests["sum"]["isMonotonic"], true);
        let points = requests["sum"]["dataPoints"].as_array().unwrap();
        assert_eq!(points.len(), 2);
        let totals: Vec<&str> = points.iter().map(|p| p["asInt"].as_str().unwrap()).collect();
        assert!(totals.contains(&"2"));
        assert!(totals.contains(&"1"));

        let latency = &metrics[1];
        assert_eq!(latency["unit"], "ms");
        let point = &latency["histogram"]["dataPoints"][0];
        assert_eq!(point["count"], "2");
        assert_eq!(point["bucketCounts"][2], "1");
        assert_eq!(point["bucketCounts"][LATENCY_BUCKET_BOUNDS.len()], "1");
    }
}
