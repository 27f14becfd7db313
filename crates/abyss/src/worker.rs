//! Short-lived worker hosting the user handler.
//!
//! One worker per datagram (or per broadcast datagram). The worker waits on
//! its private mailbox for the handoff, runs the handler, then either stays
//! alive for more events under an adaptive idle timeout or terminates. Every
//! exit path runs the same termination contract: close the connection
//! metrics, report the response time if a reply went out, and stop the span
//! with the exit reason.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::handler::{Handler, Next, TimeoutSpec, WorkerContext};
use crate::supervisor::WorkerSupervisor;
use crate::telemetry::{Span, TelemetryHub};
use crate::transport::{Datagram, Transport};

/// Number of recent handler durations the adaptive timeout averages over.
const HISTORY_CAPACITY: usize = 10;

pub(crate) enum WorkerEvent {
    Datagram(Datagram),
    Shutdown,
}

/// Everything a worker needs, assembled by the dispatcher.
pub(crate) struct WorkerSpec<H: Handler> {
    pub handler: Arc<H>,
    pub settings: Arc<Settings>,
    pub hub: Arc<TelemetryHub>,
    pub transport: Arc<dyn Transport>,
    pub listener_id: usize,
    pub span: Span,
}

#[derive(Debug)]
pub(crate) enum ExitReason {
    /// Handler returned `Next::Close`.
    LocalClosed,
    /// Idle past the adaptive timeout.
    Timeout,
    /// Shutdown signal from the supervisor.
    Shutdown,
    /// Broadcast-mode worker finished its single datagram.
    Broadcast,
    MemoryLimitExceeded,
    /// Handler returned `Next::Fail`.
    HandlerError(String),
    /// Handler panicked.
    HandlerPanic(String),
}

impl ExitReason {
    fn label(&self) -> &'static str {
        match self {
            ExitReason::LocalClosed => "local_closed",
            ExitReason::Timeout => "timeout",
            ExitReason::Shutdown => "shutdown",
            ExitReason::Broadcast => "broadcast",
            ExitReason::MemoryLimitExceeded => "memory_limit_exceeded",
            ExitReason::HandlerError(_) => "handler_error",
            ExitReason::HandlerPanic(_) => "handler_crashed",
        }
    }
}

/// Removes the worker from the supervisor on every exit path, including a
/// panicking handler unwinding through `run`.
struct Deregister {
    supervisor: Arc<WorkerSupervisor>,
    id: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.supervisor.release(self.id);
    }
}

pub(crate) fn run<H: Handler>(
    spec: WorkerSpec<H>,
    events: Receiver<WorkerEvent>,
    supervisor: Arc<WorkerSupervisor>,
    worker_id: u64,
) {
    let _guard = Deregister {
        supervisor,
        id: worker_id,
    };
    let WorkerSpec {
        handler,
        settings,
        hub,
        transport,
        listener_id,
        span,
    } = spec;

    hub.track_connection_accepted();

    let ctx = WorkerContext::new(
        span.span_ref(),
        span.started(),
        listener_id,
        transport,
        Arc::clone(&hub),
        Arc::clone(&settings),
    );

    let mut state = Some(handler.initial_state(&ctx));
    let mut history = ProcessingHistory::new(HISTORY_CAPACITY);
    let mut base_timeout = settings.read_timeout;
    let mut idle_deadline = Instant::now() + base_timeout;
    let mut next_memory_check = Instant::now() + settings.memory_check_interval;

    let reason = loop {
        let now = Instant::now();

        if now >= idle_deadline {
            if let Some(s) = state.take() {
                handler.handle_timeout(s);
            }
            break ExitReason::Timeout;
        }

        if now >= next_memory_check {
            next_memory_check = now + settings.memory_check_interval;
            if let Some(reason) = check_memory(&hub, &ctx, &settings) {
                state.take();
                break reason;
            }
            continue;
        }

        let wait = idle_deadline
            .min(next_memory_check)
            .saturating_duration_since(now);

        match events.recv_timeout(wait) {
            Ok(WorkerEvent::Datagram(datagram)) => {
                hub.span_event(
                    ctx.span(),
                    "recv",
                    &[("bytes", datagram.payload.len() as u64)],
                    &[],
                );
                hub.span_event(ctx.span(), "ready", &[], &[]);

                let Some(current) = state.take() else {
                    break ExitReason::Shutdown;
                };

                let started = Instant::now();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    handler.handle_data(&datagram, current, &ctx)
                }));
                let elapsed = started.elapsed();

                let next = match outcome {
                    Ok(next) => next,
                    Err(panic) => {
                        break ExitReason::HandlerPanic(panic_message(panic.as_ref()));
                    }
                };

                history.record(elapsed);

                let next_wait = match next {
                    Next::Continue(s) => {
                        state = Some(s);
                        adaptive_timeout(base_timeout, &history)
                    }
                    Next::ContinueFor(s, TimeoutSpec::Once(timeout)) => {
                        state = Some(s);
                        timeout
                    }
                    Next::ContinueFor(s, TimeoutSpec::Persistent(timeout)) => {
                        state = Some(s);
                        base_timeout = timeout;
                        adaptive_timeout(base_timeout, &history)
                    }
                    Next::Close(s) => {
                        handler.handle_close(s);
                        break ExitReason::LocalClosed;
                    }
                    Next::Fail(s, reason) => {
                        handler.handle_error(&reason, s);
                        break ExitReason::HandlerError(reason);
                    }
                };

                if settings.broadcast {
                    break ExitReason::Broadcast;
                }
                idle_deadline = Instant::now() + next_wait;
            }
            Ok(WorkerEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(s) = state.take() {
                    handler.handle_shutdown(s);
                }
                break ExitReason::Shutdown;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    };

    terminate(reason, span, &ctx, &hub, &settings);
}

/// The termination contract, common to every exit path. Socket receive
/// rights never left the listener, so there is no ownership to restore; the
/// remaining steps are metrics close, response-time accounting, and the span
/// stop.
fn terminate(
    reason: ExitReason,
    span: Span,
    ctx: &WorkerContext,
    hub: &TelemetryHub,
    settings: &Settings,
) {
    hub.track_connection_closed();

    if let Some(elapsed_ms) = ctx.first_response_ms() {
        hub.track_response_sent(elapsed_ms);
        hub.span_event(
            ctx.span(),
            "response_time",
            &[("response_time_ms", elapsed_ms)],
            &[],
        );
    }

    let silent = settings.silent_terminate_on_error
        && matches!(reason, ExitReason::HandlerError(_));

    match &reason {
        ExitReason::HandlerError(detail) if !silent => {
            error!(target: "abyss::worker", reason = %detail, "worker terminated on handler error");
        }
        ExitReason::HandlerPanic(detail) => {
            error!(target: "abyss::worker", reason = %detail, "worker terminated on handler panic");
        }
        ExitReason::MemoryLimitExceeded => {
            warn!(target: "abyss::worker", "worker terminated over memory limit");
        }
        _ => {
            debug!(target: "abyss::worker", reason = reason.label(), "worker terminated");
        }
    }

    let mut metadata = vec![("reason", reason.label().to_string())];
    match &reason {
        ExitReason::HandlerError(detail) | ExitReason::HandlerPanic(detail) => {
            metadata.push(("detail", detail.clone()));
        }
        _ => {}
    }
    if silent {
        metadata.push(("silent_termination", "true".to_string()));
    }
    hub.stop_span(span, metadata);
}

/// Sample resident memory; over the warning threshold, emit the warning and
/// re-measure; still over the hard limit, terminate the worker.
fn check_memory(
    hub: &TelemetryHub,
    ctx: &WorkerContext,
    settings: &Settings,
) -> Option<ExitReason> {
    let memory_mb = resident_memory_mb()?;
    if memory_mb > settings.memory_warn_mb {
        warn!(
            target: "abyss::worker",
            memory_mb,
            warn_mb = settings.memory_warn_mb,
            "resident memory above warning threshold"
        );
        hub.span_event(ctx.span(), "memory_warning", &[("memory_mb", memory_mb)], &[]);

        let remeasured = resident_memory_mb().unwrap_or(memory_mb);
        if remeasured > settings.memory_hard_mb {
            return Some(ExitReason::MemoryLimitExceeded);
        }
    }
    None
}

/// Resident set size of the process in megabytes, from `/proc/self/statm`.
#[cfg(target_os = "linux")]
pub(crate) fn resident_memory_mb() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages.saturating_mul(page_size as u64) / (1024 * 1024))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn resident_memory_mb() -> Option<u64> {
    None
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Ring buffer of the most recent handler durations.
pub(crate) struct ProcessingHistory {
    samples: Vec<Duration>,
    index: usize,
    capacity: usize,
}

impl ProcessingHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than 0");
        Self {
            samples: vec![Duration::ZERO; capacity],
            index: 0,
            capacity,
        }
    }

    pub(crate) fn record(&mut self, duration: Duration) {
        self.samples[self.index % self.capacity] = duration;
        self.index = self.index.wrapping_add(1);
    }

    pub(crate) fn len(&self) -> usize {
        self.index.min(self.capacity)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index == 0
    }

    pub(crate) fn mean(&self) -> Duration {
        if self.is_empty() {
            return Duration::ZERO;
        }
        let slice = &self.samples[..self.len()];
        slice.iter().sum::<Duration>() / slice.len() as u32
    }
}

/// Target three times the recent average handler duration, clamped to
/// `[base/2, base*2]`. All arithmetic in milliseconds.
pub(crate) fn adaptive_timeout(base: Duration, history: &ProcessingHistory) -> Duration {
    if history.is_empty() {
        return base;
    }
    let base_ms = base.as_millis() as u64;
    let avg_ms = history.mean().as_millis() as u64;
    let candidate = avg_ms.saturating_mul(3);
    Duration::from_millis(candidate.clamp(base_ms / 2, base_ms.saturating_mul(2)))
}
