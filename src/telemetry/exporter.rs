//! Background export of spans and metric samples.
//!
//! The [`Exporter`] owns a tokio task fed through an unbounded channel. Closed
//! spans are buffered and handed to the [`TelemetrySink`] together with every
//! metric sample drained from the registry:
//!
//! - on every tick of the export interval;
//! - immediately, when the interval is zero;
//! - as soon as `max_batch_size` spans are buffered;
//! - on [`Exporter::flush`] and [`Exporter::shutdown`].
//!
//! Commands are processed in order, so a flush issued after a span was closed
//! always includes that span.

use super::metrics::MetricsRegistry;
use super::sink::TelemetrySink;
use super::span::SpanRecord;
use crate::domain::TelemetryError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::Instrument;

/// When and how much to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSettings {
    /// Export period; zero exports every span as soon as it closes.
    pub interval: Duration,
    /// Buffered spans that trigger an export before the interval elapses.
    pub max_batch_size: usize,
}

impl ExportSettings {
    /// Default period between exports.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10_000);

    /// Default batch size.
    pub const DEFAULT_MAX_BATCH_SIZE: usize = 512;

    /// Exports every span as soon as it closes.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            interval: Duration::ZERO,
            max_batch_size: Self::DEFAULT_MAX_BATCH_SIZE,
        }
    }

    /// Exports every `interval`.
    #[must_use]
    pub const fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_batch_size: Self::DEFAULT_MAX_BATCH_SIZE,
        }
    }

    /// Sets the batch size; zero is treated as one.
    #[must_use]
    pub const fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = if max_batch_size == 0 { 1 } else { max_batch_size };
        self
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self::every(Self::DEFAULT_INTERVAL)
    }
}

enum Command {
    Span(SpanRecord),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the export task.
///
/// Cheap to clone; clones talk to the same task. Must be created inside a
/// tokio runtime.
#[derive(Clone)]
pub struct Exporter {
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

impl Exporter {
    /// Spawns the export task on the current tokio runtime.
    pub(crate) fn spawn(
        sink: Arc<dyn TelemetrySink>,
        registry: MetricsRegistry,
        settings: ExportSettings,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = ExportWorker {
            sink,
            registry,
            settings,
            buffer: Vec::new(),
        };
        tokio::spawn(worker.run(receiver));
        Self { commands }
    }

    /// Queues a closed span; dropped with a debug log after shutdown.
    pub(crate) fn submit(&self, span: SpanRecord) {
        if let Err(mpsc::error::SendError(Command::Span(span))) =
            self.commands.send(Command::Span(span))
        {
            tracing::debug!(span = %span.name, "exporter is shut down, dropping span");
        }
    }

    /// Waits until everything recorded before this call has been handed to the
    /// sink.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ShutDown`] if the exporter has stopped.
    pub async fn flush(&self) -> Result<(), TelemetryError> {
        let (done, wait) = oneshot::channel();
        self.commands
            .send(Command::Flush(done))
            .map_err(|_| TelemetryError::ShutDown)?;
        wait.await.map_err(|_| TelemetryError::ShutDown)
    }

    /// Flushes, shuts the sink down and stops the task.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ShutDown`] if the exporter had already stopped.
    pub async fn shutdown(&self) -> Result<(), TelemetryError> {
        let (done, wait) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(done))
            .map_err(|_| TelemetryError::ShutDown)?;
        wait.await.map_err(|_| TelemetryError::ShutDown)
    }
}

struct ExportWorker {
    sink: Arc<dyn TelemetrySink>,
    registry: MetricsRegistry,
    settings: ExportSettings,
    buffer: Vec<SpanRecord>,
}

impl ExportWorker {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = (!self.settings.interval.is_zero()).then(|| {
            let first = tokio::time::Instant::now() + self.settings.interval;
            let mut interval = tokio::time::interval_at(first, self.settings.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        tracing::debug!(
            interval_ms = self.settings.interval.as_millis(),
            max_batch_size = self.settings.max_batch_size,
            "telemetry exporter started"
        );

        loop {
            tokio::select! {
                command = receiver.recv() => match command {
                    Some(Command::Span(span)) => {
                        self.buffer.push(span);
                        if self.settings.interval.is_zero()
                            || self.buffer.len() >= self.settings.max_batch_size
                        {
                            self.export().await;
                        }
                    }
                    Some(Command::Flush(done)) => {
                        self.export().await;
                        let _ = done.send(());
                    }
                    Some(Command::Shutdown(done)) => {
                        self.export().await;
                        if let Err(e) = self.sink.shutdown().await {
                            tracing::warn!(error = %e, "telemetry sink shutdown failed");
                        }
                        receiver.close();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.export().await;
                        break;
                    }
                },
                () = tick(&mut ticker) => self.export().await,
            }
        }

        tracing::debug!("telemetry exporter stopped");
    }

    async fn export(&mut self) {
        let spans = std::mem::take(&mut self.buffer);
        let samples = self.registry.drain_samples();

        if !spans.is_empty() {
            let exported = self
                .sink
                .export_spans(&spans)
                .instrument(tracing::debug_span!("export_spans", count = spans.len()));
            if let Err(e) = exported.await {
                tracing::warn!(error = %e, dropped = spans.len(), "span export failed");
            }
        }

        if !samples.is_empty() {
            if let Err(e) = self.sink.export_metrics(&samples).await {
                tracing::warn!(error = %e, dropped = samples.len(), "metric export failed");
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{MemorySink, MetricSample, SpanStatus, Telemetry};
    use async_trait::async_trait;

    struct FailingSink;

    #[async_trait]
    impl TelemetrySink for FailingSink {
        async fn export_spans(&self, _spans: &[SpanRecord]) -> Result<(), TelemetryError> {
            Err(TelemetryError::Transport("collector unreachable".to_string()))
        }

        async fn export_metrics(&self, _samples: &[MetricSample]) -> Result<(), TelemetryError> {
            Err(TelemetryError::Transport("collector unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn buffered_spans_wait_for_flush() {
        let sink = Arc::new(MemorySink::new());
        let settings = ExportSettings::every(Duration::from_secs(3600));
        let telemetry = Telemetry::with_sink(sink.clone(), settings);

        telemetry.recorder().start("a").end(SpanStatus::Ok);
        telemetry.metrics().increment_requests("m1", "success");
        tokio::task::yield_now().await;
        assert!(sink.spans().is_empty());

        telemetry.flush().await.unwrap();
        assert_eq!(sink.spans().len(), 1);
        assert_eq!(sink.metrics().len(), 1);
    }

    #[tokio::test]
    async fn full_batch_exports_without_flush() {
        let sink = Arc::new(MemorySink::new());
        let settings = ExportSettings::every(Duration::from_secs(3600)).with_max_batch_size(2);
        let telemetry = Telemetry::with_sink(sink.clone(), settings);

        telemetry.recorder().start("a").end(SpanStatus::Ok);
        telemetry.recorder().start("b").end(SpanStatus::Ok);

        for _ in 0..50 {
            if sink.spans().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.spans().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_tick_exports() {
        let sink = Arc::new(MemorySink::new());
        let settings = ExportSettings::every(Duration::from_millis(100));
        let telemetry = Telemetry::with_sink(sink.clone(), settings);

        telemetry.recorder().start("a").end(SpanStatus::Ok);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sink.spans().len(), 1);
    }

    #[tokio::test]
    async fn sink_failures_are_swallowed() {
        let telemetry = Telemetry::with_sink(Arc::new(FailingSink), ExportSettings::immediate());
        telemetry.recorder().start("a").end(SpanStatus::Ok);
        telemetry.metrics().increment_requests("m1", "success");
        assert!(telemetry.flush().await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_flushes_and_stops() {
        let sink = Arc::new(MemorySink::new());
        let telemetry = Telemetry::with_sink(sink.clone(), ExportSettings::default());

        telemetry.recorder().start("a").end(SpanStatus::Ok);
        telemetry.shutdown().await.unwrap();
        assert_eq!(sink.spans().len(), 1);

        assert!(matches!(telemetry.flush().await, Err(TelemetryError::ShutDown)));
        telemetry.recorder().start("late").end(SpanStatus::Ok);
        assert_eq!(sink.spans().len(), 1);
    }
}
