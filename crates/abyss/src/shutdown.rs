//! Ordered teardown.
//!
//! Listeners are suspended first so no new datagram enters the worker
//! pipeline, then live workers get the drain budget, then the listener
//! threads are joined. Running it twice is a no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::pool::ListenerPool;
use crate::supervisor::WorkerSupervisor;

pub(crate) struct ShutdownCoordinator {
    pool: Arc<ListenerPool>,
    supervisor: Arc<WorkerSupervisor>,
    done: AtomicBool,
}

impl ShutdownCoordinator {
    pub(crate) fn new(pool: Arc<ListenerPool>, supervisor: Arc<WorkerSupervisor>) -> Self {
        Self {
            pool,
            supervisor,
            done: AtomicBool::new(false),
        }
    }

    /// Returns whether the workers drained within the budget. Idempotent;
    /// repeat calls return `true` without acting.
    pub(crate) fn shutdown(&self, drain_timeout: Duration) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return true;
        }

        info!(target: "abyss::server", "shutdown: suspending listeners");
        self.pool.suspend();

        let drained = self.supervisor.drain(drain_timeout);
        if !drained {
            warn!(
                target: "abyss::server",
                remaining = self.supervisor.active_workers(),
                "drain budget exhausted; abandoning workers"
            );
        }

        self.pool.stop();
        info!(target: "abyss::server", "shutdown complete");
        drained
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}
