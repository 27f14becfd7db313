//! Span tracking, sampling, and metrics aggregation.
//!
//! A [`TelemetryHub`] owns the sampling policy and the event destination.
//! Spans are started once and stopped at most once (stopping consumes the
//! span); an unsampled span still exists as a value so children can link to
//! its id, but emits no events at all, including its stop.
//!
//! Sampling governs span events only. Metric counters (the `track_*`
//! family) are always exact.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub mod metrics;

use metrics::{MetricsSummary, MetricsTable};

static NEXT_SPAN_ID: AtomicU64 = AtomicU64::new(1);

/// Cheap copyable view of a span, sufficient for event emission.
#[derive(Debug, Clone, Copy)]
pub struct SpanRef {
    pub id: u64,
    pub name: &'static str,
    pub sampled: bool,
}

#[derive(Debug)]
pub struct Span {
    name: &'static str,
    id: u64,
    parent_id: Option<u64>,
    started: Instant,
    sampled: bool,
    metadata: Vec<(&'static str, String)>,
}

impl Span {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }

    pub fn sampled(&self) -> bool {
        self.sampled
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn span_ref(&self) -> SpanRef {
        SpanRef {
            id: self.id,
            name: self.name,
            sampled: self.sampled,
        }
    }
}

/// One telemetry emission: a span start/stop or an in-flight event.
pub struct TelemetryEvent<'a> {
    pub span: SpanRef,
    pub parent_id: Option<u64>,
    pub event: &'static str,
    /// Present on `stop` events only.
    pub duration: Option<Duration>,
    pub measurements: &'a [(&'static str, u64)],
    pub metadata: &'a [(&'static str, String)],
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent<'_>);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: &TelemetryEvent<'_>) {
        (**self).emit(event)
    }
}

/// Default sink: forwards events to `tracing` under the `abyss` targets.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, e: &TelemetryEvent<'_>) {
        macro_rules! forward {
            ($target:literal) => {
                tracing::trace!(
                    target: $target,
                    span = e.span.id,
                    parent = ?e.parent_id,
                    event = e.event,
                    duration_us = ?e.duration.map(|d| d.as_micros() as u64),
                    measurements = ?e.measurements,
                    metadata = ?e.metadata,
                )
            };
        }
        match e.span.name {
            "listener" => forward!("abyss::listener"),
            "connection" => forward!("abyss::connection"),
            "worker" => forward!("abyss::worker"),
            _ => forward!("abyss"),
        }
    }
}

/// Sink that records every emission; intended for tests asserting on the
/// event stream.
#[derive(Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<RecordedEvent>>,
}

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub span_name: &'static str,
    pub span_id: u64,
    pub parent_id: Option<u64>,
    pub event: &'static str,
    pub duration: Option<Duration>,
    pub measurements: Vec<(&'static str, u64)>,
    pub metadata: Vec<(&'static str, String)>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, span_name: &str, event: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.span_name == span_name && e.event == event)
            .count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, e: &TelemetryEvent<'_>) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedEvent {
                span_name: e.span.name,
                span_id: e.span.id,
                parent_id: e.parent_id,
                event: e.event,
                duration: e.duration,
                measurements: e.measurements.to_vec(),
                metadata: e.metadata.to_vec(),
            });
    }
}

pub struct TelemetryHub {
    sample_rate: f64,
    sink: Box<dyn EventSink>,
    metrics: Arc<MetricsTable>,
}

impl TelemetryHub {
    /// Hub writing to `tracing` and the process-wide metrics table.
    pub fn new(sample_rate: f64) -> Self {
        Self::with_parts(sample_rate, Box::new(TracingSink), MetricsTable::global())
    }

    pub fn with_parts(
        sample_rate: f64,
        sink: Box<dyn EventSink>,
        metrics: Arc<MetricsTable>,
    ) -> Self {
        Self {
            sample_rate,
            sink,
            metrics,
        }
    }

    /// Listener spans are always sampled; connection spans with probability
    /// `sample_rate`; any other name is sampled.
    fn decide_sampling(&self, name: &'static str) -> bool {
        match name {
            "connection" => fastrand::f64() < self.sample_rate,
            _ => true,
        }
    }

    pub fn start_span(&self, name: &'static str, metadata: Vec<(&'static str, String)>) -> Span {
        self.new_span(name, None, metadata)
    }

    /// Child spans record their parent's id and apply sampling
    /// independently.
    pub fn start_child_span(
        &self,
        parent: &Span,
        name: &'static str,
        metadata: Vec<(&'static str, String)>,
    ) -> Span {
        self.new_span(name, Some(parent.id), metadata)
    }

    fn new_span(
        &self,
        name: &'static str,
        parent_id: Option<u64>,
        metadata: Vec<(&'static str, String)>,
    ) -> Span {
        let span = Span {
            name,
            id: NEXT_SPAN_ID.fetch_add(1, Ordering::Relaxed),
            parent_id,
            started: Instant::now(),
            sampled: self.decide_sampling(name),
            metadata,
        };
        if span.sampled {
            self.sink.emit(&TelemetryEvent {
                span: span.span_ref(),
                parent_id: span.parent_id,
                event: "start",
                duration: None,
                measurements: &[],
                metadata: &span.metadata,
            });
        }
        span
    }

    /// Emit an in-flight event on `span`; suppressed when unsampled.
    pub fn span_event(
        &self,
        span: &SpanRef,
        event: &'static str,
        measurements: &[(&'static str, u64)],
        metadata: &[(&'static str, String)],
    ) {
        if !span.sampled {
            return;
        }
        self.sink.emit(&TelemetryEvent {
            span: *span,
            parent_id: None,
            event,
            duration: None,
            measurements,
            metadata,
        });
    }

    /// End the span, emitting its stop event with the measured duration and
    /// the start metadata merged with `metadata`. Consumes the span, so a
    /// stop happens at most once.
    pub fn stop_span(&self, span: Span, metadata: Vec<(&'static str, String)>) -> Duration {
        let duration = span.started.elapsed();
        if span.sampled {
            let mut merged = span.metadata.clone();
            merged.extend(metadata);
            self.sink.emit(&TelemetryEvent {
                span: span.span_ref(),
                parent_id: span.parent_id,
                event: "stop",
                duration: Some(duration),
                measurements: &[],
                metadata: &merged,
            });
        }
        duration
    }

    pub fn track_connection_accepted(&self) {
        self.metrics.connection_accepted();
    }

    pub fn track_connection_closed(&self) {
        self.metrics.connection_closed();
    }

    pub fn track_response_sent(&self, _elapsed_ms: u64) {
        self.metrics.response_sent();
    }

    pub fn get_metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn metrics_table(&self) -> &MetricsTable {
        &self.metrics
    }
}
