//! The user-facing handler contract.
//!
//! Applications implement [`Handler`] and hand it to the server through
//! `Config`. The framework invokes `handle_data` once per admitted datagram
//! on a dedicated worker; the remaining callbacks are optional lifecycle
//! hooks with no-op defaults.
//!
//! # Example
//!
//! ```ignore
//! struct Echo;
//!
//! impl Handler for Echo {
//!     type State = ();
//!
//!     fn initial_state(&self, _ctx: &WorkerContext) -> Self::State {}
//!
//!     fn handle_data(&self, datagram: &Datagram, state: (), ctx: &WorkerContext) -> Next<()> {
//!         ctx.reply(datagram, &datagram.payload);
//!         Next::Continue(state)
//!     }
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::telemetry::{SpanRef, TelemetryHub};
use crate::transport::{Datagram, Transport};

/// What the worker should do after a handler callback returns.
pub enum Next<S> {
    /// Keep the worker alive and wait for the next event under the adaptive
    /// timeout.
    Continue(S),
    /// As `Continue`, but with an explicit timeout for the next wait.
    ContinueFor(S, TimeoutSpec),
    /// Terminate the worker cleanly; `handle_close` is invoked.
    Close(S),
    /// Terminate the worker with an error; `handle_error` is invoked.
    Fail(S, String),
}

/// Timeout override carried by [`Next::ContinueFor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSpec {
    /// Applies to the next wait only.
    Once(Duration),
    /// Replaces the configured read timeout for the rest of the worker's
    /// life; the adaptive computation continues from the new base.
    Persistent(Duration),
}

pub trait Handler: Send + Sync + 'static {
    /// Free-form per-worker state threaded through the callbacks.
    type State: Send + 'static;

    /// Build the state for a newly spawned worker.
    fn initial_state(&self, ctx: &WorkerContext) -> Self::State;

    /// Process one datagram. Replies go out through `ctx`.
    fn handle_data(
        &self,
        datagram: &Datagram,
        state: Self::State,
        ctx: &WorkerContext,
    ) -> Next<Self::State>;

    /// The worker is closing after `Next::Close`.
    fn handle_close(&self, _state: Self::State) {}

    /// The worker is terminating after `Next::Fail`.
    fn handle_error(&self, _reason: &str, _state: Self::State) {}

    /// The server asked the worker to terminate (shutdown or drain).
    fn handle_shutdown(&self, _state: Self::State) {}

    /// The worker went idle past its adaptive timeout.
    fn handle_timeout(&self, _state: Self::State) {}
}

const NO_RESPONSE: u64 = u64::MAX;

/// Per-worker environment handed to every handler callback that needs one.
///
/// Holds a send-capable reference to the listener's socket. Receiving on
/// that socket is the listener's alone; the context deliberately exposes no
/// way to do it.
pub struct WorkerContext {
    span: SpanRef,
    span_started: Instant,
    listener_id: usize,
    transport: Arc<dyn Transport>,
    hub: Arc<TelemetryHub>,
    settings: Arc<Settings>,
    first_response_ms: AtomicU64,
}

impl WorkerContext {
    pub(crate) fn new(
        span: SpanRef,
        span_started: Instant,
        listener_id: usize,
        transport: Arc<dyn Transport>,
        hub: Arc<TelemetryHub>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            span,
            span_started,
            listener_id,
            transport,
            hub,
            settings,
            first_response_ms: AtomicU64::new(NO_RESPONSE),
        }
    }

    /// Id of the listener whose socket received the datagram.
    pub fn listener_id(&self) -> usize {
        self.listener_id
    }

    /// Telemetry span id of this worker's connection span.
    pub fn span_id(&self) -> u64 {
        self.span.id
    }

    /// Local address of the socket replies are sent from.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr().ok()
    }

    /// The configured base read timeout.
    pub fn read_timeout(&self) -> Duration {
        self.settings.read_timeout
    }

    /// Send `payload` back to the datagram's source. Fire-and-forget;
    /// returns whether the send succeeded.
    pub fn reply(&self, datagram: &Datagram, payload: &[u8]) -> bool {
        self.send_to(payload, datagram.source)
    }

    /// Send `payload` to an arbitrary destination through the listener's
    /// socket. Fire-and-forget.
    pub fn send_to(&self, payload: &[u8], dest: SocketAddr) -> bool {
        match self.transport.send(payload, dest) {
            Ok(()) => {
                self.hub
                    .span_event(&self.span, "send", &[("bytes", payload.len() as u64)], &[]);
                let elapsed_ms = self.span_started.elapsed().as_millis() as u64;
                let _ = self.first_response_ms.compare_exchange(
                    NO_RESPONSE,
                    elapsed_ms,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                true
            }
            Err(e) => {
                if self.transport.is_closed() {
                    self.hub.span_event(&self.span, "socket_shutdown", &[], &[]);
                } else {
                    self.hub.span_event(
                        &self.span,
                        "send_error",
                        &[],
                        &[("error", e.to_string())],
                    );
                }
                false
            }
        }
    }

    pub(crate) fn span(&self) -> &SpanRef {
        &self.span
    }

    /// Milliseconds from span start to the first successful reply, if any.
    pub(crate) fn first_response_ms(&self) -> Option<u64> {
        match self.first_response_ms.load(Ordering::Acquire) {
            NO_RESPONSE => None,
            ms => Some(ms),
        }
    }
}
