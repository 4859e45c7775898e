//! Trace correlation between diagnostic `tracing` spans and recorded call spans.

use opentelemetry::trace::{SpanId, TraceContextExt, TraceId};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Trace and span id of the current `tracing` span, as seen by OpenTelemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    /// Trace the current span belongs to.
    pub trace_id: TraceId,
    /// Id of the current span; becomes the parent of spans opened under it.
    pub parent_span_id: SpanId,
}

impl TraceContext {
    /// Captures the OpenTelemetry context of the current `tracing` span.
    ///
    /// Returns `None` when no OpenTelemetry layer is installed, the current
    /// span is disabled by the filter, or its context is otherwise invalid.
    #[must_use]
    pub fn from_current() -> Option<Self> {
        let span = tracing::Span::current();
        if span.is_disabled() {
            return None;
        }

        let otel_context = span.context();
        let span_ref = otel_context.span();
        let span_context = span_ref.span_context();

        if !span_context.is_valid() {
            return None;
        }

        let ctx = Self {
            trace_id: span_context.trace_id(),
            parent_span_id: span_context.span_id(),
        };
        tracing::trace!(trace_id = %ctx.trace_id_hex(), "capturing trace context");
        Some(ctx)
    }

    /// Trace id as 32 lowercase hex digits.
    #[must_use]
    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_context_without_an_active_span() {
        assert!(TraceContext::from_current().is_none());
    }

    #[test]
    fn hex_formatting_is_zero_padded() {
        let ctx = TraceContext {
            trace_id: TraceId::from_bytes(0x2a_u128.to_be_bytes()),
            parent_span_id: SpanId::from_bytes(1_u64.to_be_bytes()),
        };
        assert_eq!(ctx.trace_id_hex(), format!("{}2a", "0".repeat(30)));
    }

    #[test]
    fn captures_the_entered_span_under_an_opentelemetry_layer() {
        use opentelemetry::trace::TracerProvider as _;
        use tracing_subscriber::layer::SubscriberExt;

        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("context-test")));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("chat_turn");
            let _entered = span.enter();
            let ctx = TraceContext::from_current().unwrap();
            assert_ne!(ctx.trace_id, TraceId::INVALID);
            assert_ne!(ctx.parent_span_id, SpanId::INVALID);
        });
    }
}
