//! Per-source token-bucket admission control.
//!
//! One bucket per source IP, created on that source's first packet and
//! refilled continuously at `max_packets / window` tokens per millisecond.
//! Buckets untouched for ten windows are dropped by the periodic sweep.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// How often the server's sweeper thread prunes stale buckets.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Buckets idle for this many windows are garbage-collected.
const STALE_WINDOWS: u32 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    /// Sources with a live bucket.
    pub sources: usize,
    pub admitted: u64,
    pub rejected: u64,
}

pub struct RateLimiter {
    enabled: bool,
    max_packets: u64,
    window: Duration,
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    pub fn new(enabled: bool, max_packets: u64, window: Duration) -> Self {
        Self {
            enabled,
            max_packets,
            window,
            buckets: Mutex::new(HashMap::new()),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Disabled limiter that admits everything.
    pub fn disabled() -> Self {
        Self::new(false, 0, Duration::from_secs(1))
    }

    /// Should a packet from `source` be admitted? Consumes one token on
    /// admission; rejection consumes nothing.
    pub fn allow(&self, source: IpAddr) -> bool {
        self.allow_at(source, Instant::now())
    }

    fn allow_at(&self, source: IpAddr, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }

        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let bucket = buckets
            .entry(source)
            .or_insert_with(|| TokenBucket::new(self.max_packets, self.window, now));
        bucket.refill(now, self.window);

        if bucket.try_consume() {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Drop buckets whose last refill is older than ten windows. Returns how
    /// many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let stale_after = self.window * STALE_WINDOWS;
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < stale_after);
        before - buckets.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        let sources = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len();

        RateLimiterStats {
            sources,
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    refill_rate_per_ms: f64,
}

impl TokenBucket {
    fn new(max_packets: u64, window: Duration, now: Instant) -> Self {
        let max_tokens = max_packets as f64;
        Self {
            tokens: max_tokens,
            last_refill: now,
            max_tokens,
            refill_rate_per_ms: max_tokens / window.as_millis().max(1) as f64,
        }
    }

    fn refill(&mut self, now: Instant, window: Duration) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed >= window {
            self.tokens = self.max_tokens;
        } else {
            let replenished = elapsed.as_millis() as f64 * self.refill_rate_per_ms;
            self.tokens = (self.tokens + replenished).min(self.max_tokens);
        }
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
