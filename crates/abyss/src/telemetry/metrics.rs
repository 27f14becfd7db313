//! Connection and response accounting.
//!
//! A [`MetricsTable`] is a set of atomic counters plus two rolling
//! one-second rate windows. Counters are exact and never subject to span
//! sampling. Each server owns its own table; a process-wide default exists
//! behind [`MetricsTable::global`] with at-most-once initialization across
//! racing threads.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

const RATE_WINDOW_MS: u64 = 1000;

static GLOBAL: OnceLock<Arc<MetricsTable>> = OnceLock::new();

/// Point-in-time view of a [`MetricsTable`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub connections_active: i64,
    pub connections_total: u64,
    pub accepts_total: u64,
    pub responses_total: u64,
    pub accepts_per_second: u64,
    pub responses_per_second: u64,
    pub rate_limited_drops: u64,
    pub oversize_drops: u64,
}

pub struct MetricsTable {
    epoch: Instant,
    connections_active: AtomicI64,
    connections_total: AtomicU64,
    accepts_total: AtomicU64,
    responses_total: AtomicU64,
    rate_limited_drops: AtomicU64,
    oversize_drops: AtomicU64,
    accept_rate: RollingRate,
    response_rate: RollingRate,
}

impl Default for MetricsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsTable {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            connections_active: AtomicI64::new(0),
            connections_total: AtomicU64::new(0),
            accepts_total: AtomicU64::new(0),
            responses_total: AtomicU64::new(0),
            rate_limited_drops: AtomicU64::new(0),
            oversize_drops: AtomicU64::new(0),
            accept_rate: RollingRate::new(),
            response_rate: RollingRate::new(),
        }
    }

    /// The process-wide table. Racing first callers converge on one
    /// instance.
    pub fn global() -> Arc<MetricsTable> {
        GLOBAL.get_or_init(|| Arc::new(MetricsTable::new())).clone()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn connection_accepted(&self) {
        self.connections_active.fetch_add(1, Ordering::AcqRel);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.accepts_total.fetch_add(1, Ordering::Relaxed);
        self.accept_rate.increment(self.now_ms());
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn response_sent(&self) {
        self.responses_total.fetch_add(1, Ordering::Relaxed);
        self.response_rate.increment(self.now_ms());
    }

    pub fn drop_rate_limited(&self) {
        self.rate_limited_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drop_oversize(&self) {
        self.oversize_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        let now_ms = self.now_ms();
        MetricsSummary {
            connections_active: self.connections_active.load(Ordering::Acquire),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            accepts_total: self.accepts_total.load(Ordering::Relaxed),
            responses_total: self.responses_total.load(Ordering::Relaxed),
            accepts_per_second: self.accept_rate.per_second(now_ms),
            responses_per_second: self.response_rate.per_second(now_ms),
            rate_limited_drops: self.rate_limited_drops.load(Ordering::Relaxed),
            oversize_drops: self.oversize_drops.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter and restore the rate windows to their initial
    /// state. Idempotent.
    pub fn reset(&self) {
        self.connections_active.store(0, Ordering::Release);
        self.connections_total.store(0, Ordering::Release);
        self.accepts_total.store(0, Ordering::Release);
        self.responses_total.store(0, Ordering::Release);
        self.rate_limited_drops.store(0, Ordering::Release);
        self.oversize_drops.store(0, Ordering::Release);
        self.accept_rate.reset();
        self.response_rate.reset();
    }
}

/// A one-second event-rate window: `[window_start, window_start + 1s)`
/// accumulates a count; reads report `count * 1000 / elapsed` rounded, or
/// zero once the window has lapsed. The first increment after a lapse
/// reinitializes the window. Increments are atomic; reads are eventually
/// consistent.
struct RollingRate {
    window_start_ms: AtomicU64,
    count: AtomicU64,
}

impl RollingRate {
    fn new() -> Self {
        Self {
            window_start_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn increment(&self, now_ms: u64) {
        let start = self.window_start_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(start) >= RATE_WINDOW_MS
            && self
                .window_start_ms
                .compare_exchange(start, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // Won the reinitialization; racing increments in the new window
            // land on top of the 1.
            self.count.store(1, Ordering::Release);
            return;
        }
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn per_second(&self, now_ms: u64) -> u64 {
        let start = self.window_start_ms.load(Ordering::Acquire);
        let elapsed = now_ms.saturating_sub(start);
        if elapsed >= RATE_WINDOW_MS {
            return 0;
        }
        let count = self.count.load(Ordering::Acquire);
        let divisor = elapsed.max(1);
        (count * RATE_WINDOW_MS + divisor / 2) / divisor
    }

    fn reset(&self) {
        self.window_start_ms.store(0, Ordering::Release);
        self.count.store(0, Ordering::Release);
    }
}
