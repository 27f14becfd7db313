//! Root composition.
//!
//! `Server::start` brings the components up leaves-first: telemetry, rate
//! limiter (with its sweeper), worker supervisor, listener pool, and finally
//! the activation step that tells every listener to start receiving.
//! Teardown runs the same order in reverse through the shutdown
//! coordinator.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Error;
use crate::handler::Handler;
use crate::pool::ListenerPool;
use crate::rate_limit::{RateLimiter, SWEEP_INTERVAL};
use crate::shutdown::ShutdownCoordinator;
use crate::supervisor::WorkerSupervisor;
use crate::telemetry::metrics::{MetricsSummary, MetricsTable};
use crate::telemetry::{TelemetryHub, TracingSink};

/// A running UDP server. Stopping is explicit via [`Server::stop`] or
/// implicit on drop.
pub struct Server {
    hub: Arc<TelemetryHub>,
    rate_limiter: Arc<RateLimiter>,
    supervisor: Arc<WorkerSupervisor>,
    pool: Arc<ListenerPool>,
    coordinator: ShutdownCoordinator,
    shutdown_timeout: Duration,
    sweeper: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl Server {
    pub fn start<H: Handler>(mut config: Config<H>) -> Result<Self, Error> {
        config.validate()?;

        let sink = config
            .event_sink
            .take()
            .unwrap_or_else(|| Box::new(TracingSink));
        let hub = Arc::new(TelemetryHub::with_parts(
            config.telemetry_sample_rate,
            sink,
            Arc::new(MetricsTable::new()),
        ));

        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_enabled,
            config.rate_limit_max_packets,
            config.rate_limit_window,
        ));
        let sweeper = if config.rate_limit_enabled {
            Some(spawn_sweeper(Arc::clone(&rate_limiter))?)
        } else {
            None
        };

        let supervisor = WorkerSupervisor::new(config.max_workers);
        let settings = Arc::new(config.settings());
        let pool = Arc::new(ListenerPool::start(
            &config,
            &settings,
            &hub,
            &supervisor,
            &rate_limiter,
        )?);

        // Activation: one-shot signal after every sibling is up.
        debug!(target: "abyss::server", "activating listeners");
        pool.start_listening();

        info!(
            target: "abyss::server",
            addr = %pool.local_addr(),
            listeners = pool.listener_count(),
            max_workers = ?supervisor.max_workers(),
            broadcast = config.broadcast,
            "server started"
        );

        let coordinator = ShutdownCoordinator::new(Arc::clone(&pool), Arc::clone(&supervisor));

        Ok(Self {
            hub,
            rate_limiter,
            supervisor,
            pool,
            coordinator,
            shutdown_timeout: config.shutdown_timeout,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// The bound address every listener shares. With `port = 0` this is
    /// where the OS-chosen port is learned.
    pub fn local_addr(&self) -> SocketAddr {
        self.pool.local_addr()
    }

    /// Stop receiving, give workers up to `drain_timeout` to finish, then
    /// tear down. Returns whether all workers drained in time. Stopping an
    /// already-stopped server is a no-op that returns `true`.
    pub fn stop(&self, drain_timeout: Duration) -> bool {
        let drained = self.coordinator.shutdown(drain_timeout);

        if let Some((stop_tx, thread)) = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            drop(stop_tx);
            let _ = thread.join();
        }

        drained
    }

    pub fn is_stopped(&self) -> bool {
        self.coordinator.is_done()
    }

    /// Stop all listeners receiving without touching live workers.
    /// Suspended listeners hold no socket.
    pub fn suspend(&self) {
        self.pool.suspend();
    }

    /// Rebind and resume the listeners.
    pub fn resume(&self) {
        self.pool.resume();
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.hub.get_metrics()
    }

    pub fn rate_limiter_stats(&self) -> crate::rate_limit::RateLimiterStats {
        self.rate_limiter.stats()
    }

    pub fn active_workers(&self) -> usize {
        self.supervisor.active_workers()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop(self.shutdown_timeout);
    }
}

/// Periodic bucket garbage collection. Exits when the server drops the
/// sender.
fn spawn_sweeper(limiter: Arc<RateLimiter>) -> Result<(Sender<()>, JoinHandle<()>), Error> {
    let (stop_tx, stop_rx) = bounded::<()>(0);

    let thread = std::thread::Builder::new()
        .name("abyss-rate-limit-sweeper".to_string())
        .spawn(move || {
            loop {
                match stop_rx.recv_timeout(SWEEP_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {
                        let dropped = limiter.sweep();
                        if dropped > 0 {
                            debug!(
                                target: "abyss::server",
                                dropped,
                                "swept stale rate-limit buckets"
                            );
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })
        .map_err(Error::Io)?;

    Ok((stop_tx, thread))
}
