//! Bounded parent of worker threads.
//!
//! Enforces the `max_workers` cap with an atomic reservation, hands each
//! worker its private handoff channel, and drains live workers on shutdown.
//! Workers are temporary children: they are never restarted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded};
use tracing::debug;

use crate::error::Error;
use crate::handler::Handler;
use crate::worker::{self, WorkerEvent, WorkerSpec};

/// Room for one datagram handoff plus one shutdown signal.
const MAILBOX_CAPACITY: usize = 2;

const DRAIN_POLL: Duration = Duration::from_millis(5);

/// A `start_worker` refusal. The retryable variants hand the spec back so
/// the caller can try again.
pub(crate) enum Rejected<H: Handler> {
    /// The cap is reached; retry with backoff.
    Saturated(WorkerSpec<H>),
    /// Drain has begun; drop the datagram.
    ShuttingDown(WorkerSpec<H>),
    /// The OS refused the thread; the spec was consumed by the spawn.
    SpawnFailed(Error),
}

pub(crate) struct WorkerStarted {
    pub id: u64,
    pub handoff: Sender<WorkerEvent>,
}

pub struct WorkerSupervisor {
    max_workers: Option<usize>,
    active: AtomicUsize,
    next_id: AtomicU64,
    registry: Mutex<HashMap<u64, Sender<WorkerEvent>>>,
    draining: AtomicBool,
}

impl WorkerSupervisor {
    pub fn new(max_workers: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            max_workers,
            active: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            registry: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
        })
    }

    /// Workers currently alive.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_workers(&self) -> Option<usize> {
        self.max_workers
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Spawn a worker for one datagram. Refused as `Saturated` once the cap
    /// is hit and as `ShuttingDown` after drain has begun; both hand the
    /// spec back to the caller.
    pub(crate) fn start_worker<H: Handler>(
        self: &Arc<Self>,
        spec: WorkerSpec<H>,
    ) -> Result<WorkerStarted, Rejected<H>> {
        if self.is_draining() {
            return Err(Rejected::ShuttingDown(spec));
        }

        if !self.try_reserve() {
            return Err(Rejected::Saturated(spec));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (handoff, events) = bounded(MAILBOX_CAPACITY);

        self.registry_lock().insert(id, handoff.clone());

        let supervisor = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("abyss-worker-{id}"))
            .spawn(move || worker::run(spec, events, supervisor, id));

        match spawned {
            Ok(_handle) => Ok(WorkerStarted { id, handoff }),
            Err(e) => {
                self.registry_lock().remove(&id);
                self.active.fetch_sub(1, Ordering::AcqRel);
                Err(Rejected::SpawnFailed(Error::WorkerSpawn(e)))
            }
        }
    }

    /// Reserve a worker slot, respecting the cap.
    fn try_reserve(&self) -> bool {
        match self.max_workers {
            None => {
                self.active.fetch_add(1, Ordering::AcqRel);
                true
            }
            Some(cap) => self
                .active
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < cap).then_some(n + 1)
                })
                .is_ok(),
        }
    }

    /// Called by each worker as it exits, from its deregistration guard.
    pub(crate) fn release(&self, id: u64) {
        self.registry_lock().remove(&id);
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Stop admitting workers, signal the live ones to shut down, and wait
    /// up to `timeout` for them to exit. Returns whether the pool fully
    /// drained; stragglers past the deadline are abandoned.
    pub(crate) fn drain(&self, timeout: Duration) -> bool {
        self.draining.store(true, Ordering::Release);

        let senders: Vec<Sender<WorkerEvent>> =
            self.registry_lock().values().cloned().collect();
        debug!(
            target: "abyss::server",
            workers = senders.len(),
            "draining workers"
        );
        for sender in senders {
            let _ = sender.try_send(WorkerEvent::Shutdown);
        }

        let deadline = Instant::now() + timeout;
        while self.active.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(DRAIN_POLL);
        }
        true
    }

    fn registry_lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Sender<WorkerEvent>>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(cap: Option<usize>) -> Arc<WorkerSupervisor> {
        WorkerSupervisor::new(cap)
    }

    #[test]
    fn reservation_respects_the_cap() {
        let sup = supervisor(Some(2));

        assert!(sup.try_reserve());
        assert!(sup.try_reserve());
        assert!(!sup.try_reserve());
        assert_eq!(sup.active_workers(), 2);

        sup.release(1);
        assert_eq!(sup.active_workers(), 1);
        assert!(sup.try_reserve());
    }

    #[test]
    fn zero_cap_rejects_everything() {
        let sup = supervisor(Some(0));
        assert!(!sup.try_reserve());
        assert_eq!(sup.active_workers(), 0);
    }

    #[test]
    fn unbounded_always_reserves() {
        let sup = supervisor(None);
        for _ in 0..10_000 {
            assert!(sup.try_reserve());
        }
        assert_eq!(sup.active_workers(), 10_000);
    }

    #[test]
    fn cap_holds_under_contention() {
        let sup = supervisor(Some(64));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let sup = Arc::clone(&sup);
            handles.push(thread::spawn(move || {
                (0..1000).filter(|_| sup.try_reserve()).count()
            }));
        }

        let reserved: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(reserved, 64);
        assert_eq!(sup.active_workers(), 64);
    }

    #[test]
    fn drain_with_no_workers_is_immediate() {
        let sup = supervisor(Some(4));
        assert!(sup.drain(Duration::from_millis(10)));
        assert!(sup.is_draining());
    }
}
