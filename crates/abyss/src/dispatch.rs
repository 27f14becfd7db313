//! Moves one datagram from the listener into a fresh worker.
//!
//! Saturation is handled off the listener's thread: a detached auxiliary
//! thread sleeps out the exponential backoff and re-attempts, so the receive
//! loop never blocks on the worker cap. A datagram that exhausts its retries
//! is dropped with a `limit_exceeded` event.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::TrySendError;
use tracing::{debug, error};

use crate::config::Settings;
use crate::error::Error;
use crate::handler::Handler;
use crate::supervisor::{Rejected, WorkerStarted, WorkerSupervisor};
use crate::telemetry::{Span, TelemetryHub};
use crate::transport::{Datagram, Transport};
use crate::worker::{WorkerEvent, WorkerSpec};

/// Shared environment a listener hands to every dispatch.
pub(crate) struct DispatchEnv<H: Handler> {
    pub supervisor: Arc<WorkerSupervisor>,
    pub handler: Arc<H>,
    pub settings: Arc<Settings>,
    pub hub: Arc<TelemetryHub>,
    pub transport: Arc<dyn Transport>,
    pub listener_id: usize,
}

impl<H: Handler> Clone for DispatchEnv<H> {
    fn clone(&self) -> Self {
        Self {
            supervisor: Arc::clone(&self.supervisor),
            handler: Arc::clone(&self.handler),
            settings: Arc::clone(&self.settings),
            hub: Arc::clone(&self.hub),
            transport: Arc::clone(&self.transport),
            listener_id: self.listener_id,
        }
    }
}

impl<H: Handler> DispatchEnv<H> {
    fn worker_spec(&self, span: Span) -> WorkerSpec<H> {
        WorkerSpec {
            handler: Arc::clone(&self.handler),
            settings: Arc::clone(&self.settings),
            hub: Arc::clone(&self.hub),
            transport: Arc::clone(&self.transport),
            listener_id: self.listener_id,
            span,
        }
    }
}

/// Dispatch one admitted datagram under `span`. Never blocks the caller on
/// saturation.
pub(crate) fn dispatch<H: Handler>(
    env: &DispatchEnv<H>,
    span: Span,
    datagram: Datagram,
) -> Result<(), Error> {
    match env.supervisor.start_worker(env.worker_spec(span)) {
        Ok(started) => {
            deliver(started, datagram);
            Ok(())
        }
        Err(Rejected::Saturated(spec)) => {
            if env.settings.retry_count == 0 {
                give_up(&env.hub, spec.span, 0);
            } else {
                schedule_retries(env.clone(), spec.span, datagram);
            }
            Ok(())
        }
        Err(Rejected::ShuttingDown(spec)) => {
            debug!(target: "abyss::connection", "datagram dropped during shutdown");
            env.hub
                .stop_span(spec.span, vec![("reason", "shutdown".to_string())]);
            Ok(())
        }
        Err(Rejected::SpawnFailed(e)) => Err(e),
    }
}

/// The datagram handoff. Exactly one delivery per started worker; the
/// mailbox is private to that worker and sized to hold it.
fn deliver(started: WorkerStarted, datagram: Datagram) {
    match started.handoff.try_send(WorkerEvent::Datagram(datagram)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
            debug!(
                target: "abyss::connection",
                worker = started.id,
                "worker unavailable for handoff"
            );
        }
    }
}

/// Re-attempt from a detached thread so the listener keeps receiving.
fn schedule_retries<H: Handler>(env: DispatchEnv<H>, span: Span, datagram: Datagram) {
    let spawned = thread::Builder::new()
        .name("abyss-dispatch-retry".to_string())
        .spawn(move || retry_loop(env, span, datagram));

    if let Err(e) = spawned {
        error!(target: "abyss::connection", error = %e, "failed to spawn retry thread");
    }
}

fn retry_loop<H: Handler>(env: DispatchEnv<H>, span: Span, datagram: Datagram) {
    let retries = env.settings.retry_count;
    let mut span = span;

    for attempt in 0..retries {
        thread::sleep(retry_delay(env.settings.retry_base_wait, attempt));

        match env.supervisor.start_worker(env.worker_spec(span)) {
            Ok(started) => {
                deliver(started, datagram);
                return;
            }
            Err(Rejected::Saturated(spec)) => {
                span = spec.span;
            }
            Err(Rejected::ShuttingDown(spec)) => {
                debug!(target: "abyss::connection", "retry abandoned during shutdown");
                env.hub
                    .stop_span(spec.span, vec![("reason", "shutdown".to_string())]);
                return;
            }
            Err(Rejected::SpawnFailed(e)) => {
                error!(target: "abyss::connection", error = %e, "worker spawn failed on retry");
                return;
            }
        }
    }

    give_up(&env.hub, span, retries);
}

/// Exponential backoff: `base * 1.5^attempt` plus uniform jitter in
/// `[0, delay/4]` so saturated listeners do not retry in lockstep.
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = (base.as_millis() as u64).max(1);
    let delay_ms = (base_ms as f64 * 1.5f64.powi(attempt as i32)).round() as u64;
    let jitter_ms = fastrand::u64(0..=delay_ms / 4);
    Duration::from_millis(delay_ms + jitter_ms)
}

/// Retries exhausted: emit `limit_exceeded` and drop the datagram.
fn give_up(hub: &TelemetryHub, span: Span, retries_attempted: u32) {
    debug!(
        target: "abyss::connection",
        retries_attempted,
        "datagram dropped: worker limit exceeded"
    );
    hub.span_event(
        &span.span_ref(),
        "limit_exceeded",
        &[("retries_attempted", retries_attempted as u64)],
        &[],
    );
    hub.stop_span(span, vec![("reason", "limit_exceeded".to_string())]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_waits_about_the_base() {
        for _ in 0..100 {
            let delay = retry_delay(Duration::from_millis(100), 0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn backoff_grows_by_half_per_attempt() {
        for _ in 0..100 {
            let delay = retry_delay(Duration::from_millis(100), 2);
            // 100 * 1.5^2 = 225, plus up to 56ms jitter.
            assert!(delay >= Duration::from_millis(225));
            assert!(delay <= Duration::from_millis(281));
        }
    }

    #[test]
    fn sub_millisecond_base_is_treated_as_one() {
        let delay = retry_delay(Duration::from_micros(10), 0);
        assert!(delay >= Duration::from_millis(1));
        assert!(delay <= Duration::from_millis(2));
    }
}
