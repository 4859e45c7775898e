//! Process-wide metrics registry.
//!
//! The registry keeps two views of every recording:
//!
//! - running aggregates per series (name + labels), read through
//!   [`MetricsRegistry::counter`], [`MetricsRegistry::histogram`] and
//!   [`MetricsRegistry::snapshot`];
//! - pending [`MetricSample`]s, drained by the exporter on every export.
//!
//! Recording never fails. A poisoned lock is recovered and logged, and the
//! recording proceeds on the recovered state.

use super::conventions::{
    LABEL_ERROR_TYPE, LABEL_MODEL, LABEL_STATUS, LABEL_TOKEN_TYPE, METRIC_DURATION, METRIC_ERRORS,
    METRIC_REQUESTS, METRIC_TOKENS,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

/// Label set of a series, ordered by key.
pub type Labels = BTreeMap<String, String>;

/// Upper bounds of the latency histogram buckets, in milliseconds.
pub const LATENCY_BUCKET_BOUNDS: [f64; 15] = [
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0,
    10000.0,
];

/// Pending samples kept before the oldest are dropped.
const MAX_PENDING_SAMPLES: usize = 10_000;

/// Kind of instrument a sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Histogram of independent observations.
    Histogram,
}

/// Value carried by a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// Non-negative counter delta.
    Counter(u64),
    /// One histogram observation.
    Histogram(f64),
}

/// One recording, as handed to the exporter.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// Metric name, e.g. `llm.requests.total`.
    pub name: String,
    /// Recorded value.
    pub value: MetricValue,
    /// Series labels.
    pub labels: Labels,
    /// Recording time.
    pub timestamp: SystemTime,
}

impl MetricSample {
    /// Instrument kind of this sample.
    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        match self.value {
            MetricValue::Counter(_) => MetricKind::Counter,
            MetricValue::Histogram(_) => MetricKind::Histogram,
        }
    }
}

/// Running summary of a histogram series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSummary {
    /// Number of observations.
    pub count: u64,
    /// Sum of observations.
    pub sum: f64,
    /// Smallest observation.
    pub min: f64,
    /// Largest observation.
    pub max: f64,
}

impl HistogramSummary {
    fn first(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Mean observation.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Point-in-time copy of every series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Counter series: `(name, labels) -> total`.
    pub counters: BTreeMap<(String, Labels), u64>,
    /// Histogram series: `(name, labels) -> summary`.
    pub histograms: BTreeMap<(String, Labels), HistogramSummary>,
}

#[derive(Default)]
struct RegistryState {
    counters: BTreeMap<(String, Labels), u64>,
    histograms: BTreeMap<(String, Labels), HistogramSummary>,
    pending: VecDeque<MetricSample>,
    dropped: u64,
}

/// Label-keyed counters and the latency histogram shared by all sessions.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MetricsRegistry")
            .field("counters", &state.counters.len())
            .field("histograms", &state.histograms.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one finished request; `status` is `success`, `error` or
    /// `cancelled`.
    pub fn increment_requests(&self, model: &str, status: &str) {
        self.add(
            METRIC_REQUESTS,
            labels(&[(LABEL_MODEL, model), (LABEL_STATUS, status)]),
            1,
        );
    }

    /// Adds `amount` tokens of `token_type` (`prompt`, `completion` or `total`).
    pub fn increment_tokens(&self, model: &str, token_type: &str, amount: u64) {
        self.add(
            METRIC_TOKENS,
            labels(&[(LABEL_MODEL, model), (LABEL_TOKEN_TYPE, token_type)]),
            amount,
        );
    }

    /// Records one request latency in milliseconds.
    pub fn observe_latency(&self, model: &str, duration_ms: f64) {
        self.observe(METRIC_DURATION, labels(&[(LABEL_MODEL, model)]), duration_ms);
    }

    /// Counts one failed request of category `error_kind`.
    pub fn increment_errors(&self, model: &str, error_kind: &str) {
        self.add(
            METRIC_ERRORS,
            labels(&[(LABEL_MODEL, model), (LABEL_ERROR_TYPE, error_kind)]),
            1,
        );
    }

    /// Current total of a counter series; `0` if never incremented.
    #[must_use]
    pub fn counter(&self, name: &str, series: &[(&str, &str)]) -> u64 {
        self.lock()
            .counters
            .get(&(name.to_string(), labels(series)))
            .copied()
            .unwrap_or(0)
    }

    /// Summary of a histogram series; `None` if never observed.
    #[must_use]
    pub fn histogram(&self, name: &str, series: &[(&str, &str)]) -> Option<HistogramSummary> {
        self.lock()
            .histograms
            .get(&(name.to_string(), labels(series)))
            .copied()
    }

    /// Copies every series.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        MetricsSnapshot {
            counters: state.counters.clone(),
            histograms: state.histograms.clone(),
        }
    }

    /// Takes every sample recorded since the last drain, oldest first.
    pub fn drain_samples(&self) -> Vec<MetricSample> {
        let mut state = self.lock();
        if state.dropped > 0 {
            tracing::warn!(dropped = state.dropped, "metric samples dropped before export");
            state.dropped = 0;
        }
        state.pending.drain(..).collect()
    }

    fn add(&self, name: &str, labels: Labels, amount: u64) {
        let mut state = self.lock();
        let total = state
            .counters
            .entry((name.to_string(), labels.clone()))
            .or_insert(0);
        *total = total.saturating_add(amount);
        Self::enqueue(
            &mut state,
            MetricSample {
                name: name.to_string(),
                value: MetricValue::Counter(amount),
                labels,
                timestamp: SystemTime::now(),
            },
        );
    }

    fn observe(&self, name: &str, labels: Labels, value: f64) {
        if !value.is_finite() || value < 0.0 {
            tracing::debug!(metric = name, value, "ignoring invalid histogram observation");
            return;
        }

        let mut state = self.lock();
        state
            .histograms
            .entry((name.to_string(), labels.clone()))
            .and_modify(|summary| summary.observe(value))
            .or_insert_with(|| HistogramSummary::first(value));
        Self::enqueue(
            &mut state,
            MetricSample {
                name: name.to_string(),
                value: MetricValue::Histogram(value),
                labels,
                timestamp: SystemTime::now(),
            },
        );
    }

    fn enqueue(state: &mut RegistryState, sample: MetricSample) {
        if state.pending.len() >= MAX_PENDING_SAMPLES {
            state.pending.pop_front();
            state.dropped += 1;
        }
        state.pending.push_back(sample);
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("metrics registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_series() {
        let registry = MetricsRegistry::new();
        registry.increment_requests("m1", "success");
        registry.increment_requests("m1", "success");
        registry.increment_requests("m1", "error");
        registry.increment_requests("m2", "success");

        assert_eq!(
            registry.counter(METRIC_REQUESTS, &[("model", "m1"), ("status", "success")]),
            2
        );
        assert_eq!(
            registry.counter(METRIC_REQUESTS, &[("status", "error"), ("model", "m1")]),
            1
        );
        assert_eq!(
            registry.counter(METRIC_REQUESTS, &[("model", "m3"), ("status", "success")]),
            0
        );
    }

    #[test]
    fn histogram_tracks_count_sum_min_max() {
        let registry = MetricsRegistry::new();
        registry.observe_latency("m1", 120.0);
        registry.observe_latency("m1", 30.0);
        registry.observe_latency("m1", f64::NAN);

        let summary = registry.histogram(METRIC_DURATION, &[("model", "m1")]).unwrap();
        assert_eq!(summary.count, 2);
        assert!((summary.sum - 150.0).abs() < f64::EPSILON);
        assert!((summary.min - 30.0).abs() < f64::EPSILON);
        assert!((summary.max - 120.0).abs() < f64::EPSILON);
        assert!((summary.mean() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn drain_returns_samples_once_and_keeps_aggregates() {
        let registry = MetricsRegistry::new();
        registry.increment_tokens("m1", "prompt", 3);
        registry.increment_errors("m1", "timeout");

        let samples = registry.drain_samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].kind(), MetricKind::Counter);
        assert_eq!(samples[0].value, MetricValue::Counter(3));
        assert_eq!(samples[1].labels.get("error_type").map(String::as_str), Some("timeout"));

        assert!(registry.drain_samples().is_empty());
        assert_eq!(registry.counter(METRIC_TOKENS, &[("model", "m1"), ("type", "prompt")]), 3);
    }

    #[test]
    fn clones_share_state() {
        let registry = MetricsRegistry::new();
        let clone = registry.clone();
        clone.increment_requests("m1", "success");
        assert_eq!(registry.snapshot().counters.len(), 1);
    }

    #[test]
    fn recovers_from_poisoned_lock() {
        let registry = MetricsRegistry::new();
        let poisoner = registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.state.lock().unwrap();
            panic!("poison the registry");
        })
        .join();

        registry.increment_requests("m1", "success");
        assert_eq!(
            registry.counter(METRIC_REQUESTS, &[("model", "m1"), ("status", "success")]),
            1
        );
    }
}
