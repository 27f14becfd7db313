//! One bound socket, one receive loop.
//!
//! A listener thread moves through `Ready -> Listening <-> Suspended ->
//! Terminated`, driven by pool commands. While listening it polls the
//! transport in short slices so commands are observed between receives,
//! admits each datagram past rate limiting and the size check, opens a
//! connection span, and hands the datagram to the dispatcher. It knows
//! nothing about packet contents or the handler, and it never blocks on
//! worker saturation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use tracing::{debug, error, info, trace};

use crate::config::Settings;
use crate::dispatch::{DispatchEnv, dispatch};
use crate::handler::Handler;
use crate::rate_limit::RateLimiter;
use crate::supervisor::WorkerSupervisor;
use crate::telemetry::{Span, TelemetryHub};
use crate::transport::{Datagram, RecvError, Transport, TransportOptions, bind_transport};

/// Receive slice; the gap between command checks while listening.
const POLL_INTERVAL: Duration = Duration::from_millis(350);

/// Pause before a crashed listener rebinds.
const RESTART_BACKOFF: Duration = Duration::from_millis(250);

/// Pause between bind attempts when the port is unavailable.
const REBIND_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) enum ListenerCommand {
    StartListening,
    Suspend,
    Resume,
    Stop,
}

enum LoopExit {
    Suspend,
    Stop,
    /// Transport reported closed; a clean stop.
    Closed,
    Fatal(std::io::Error),
}

pub(crate) struct Listener<H: Handler> {
    pub id: usize,
    pub handler: Arc<H>,
    pub settings: Arc<Settings>,
    pub hub: Arc<TelemetryHub>,
    pub supervisor: Arc<WorkerSupervisor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub commands: Receiver<ListenerCommand>,
    pub bind_addr: SocketAddr,
    pub transport_options: TransportOptions,
    pub broadcast: bool,
    /// Socket bound ahead of time by the pool to resolve an OS-chosen port;
    /// consumed by the first transition into Listening.
    pub prebound: Option<Arc<dyn Transport>>,
}

impl<H: Handler> Listener<H> {
    pub(crate) fn run(mut self) {
        // Ready: wait for the activation signal.
        loop {
            match self.commands.recv() {
                Ok(ListenerCommand::StartListening) => break,
                Ok(ListenerCommand::Stop) | Err(_) => return,
                Ok(_) => {}
            }
        }

        // Listening, with one-for-one restart on fatal socket errors and a
        // Suspended parking state in between.
        loop {
            let Some(transport) = self.acquire_transport() else {
                return;
            };

            let span = self.hub.start_span(
                "listener",
                vec![
                    ("listener_id", self.id.to_string()),
                    ("addr", self.bind_addr.to_string()),
                ],
            );
            info!(
                target: "abyss::listener",
                listener_id = self.id,
                addr = %self.bind_addr,
                "listening"
            );

            match self.listen_loop(&transport, &span) {
                LoopExit::Suspend => {
                    transport.close();
                    self.hub
                        .stop_span(span, vec![("reason", "suspended".to_string())]);
                    debug!(target: "abyss::listener", listener_id = self.id, "suspended");

                    if self.await_resume() {
                        continue;
                    }
                    return;
                }
                LoopExit::Stop => {
                    transport.close();
                    self.hub
                        .stop_span(span, vec![("reason", "stop".to_string())]);
                    return;
                }
                LoopExit::Closed => {
                    self.hub
                        .stop_span(span, vec![("reason", "closed".to_string())]);
                    debug!(target: "abyss::listener", listener_id = self.id, "socket closed");
                    return;
                }
                LoopExit::Fatal(e) => {
                    error!(
                        target: "abyss::listener",
                        listener_id = self.id,
                        error = %e,
                        "receive failed; restarting listener"
                    );
                    transport.close();
                    self.hub
                        .stop_span(span, vec![("reason", format!("recv_error: {e}"))]);
                    std::thread::sleep(RESTART_BACKOFF);
                }
            }
        }
    }

    fn listen_loop(&self, transport: &Arc<dyn Transport>, listener_span: &Span) -> LoopExit {
        let env = DispatchEnv {
            supervisor: Arc::clone(&self.supervisor),
            handler: Arc::clone(&self.handler),
            settings: Arc::clone(&self.settings),
            hub: Arc::clone(&self.hub),
            transport: Arc::clone(transport),
            listener_id: self.id,
        };

        self.hub
            .span_event(&listener_span.span_ref(), "waiting", &[], &[]);

        loop {
            match self.commands.try_recv() {
                Ok(ListenerCommand::Suspend) => return LoopExit::Suspend,
                Ok(ListenerCommand::Stop) | Err(TryRecvError::Disconnected) => {
                    return LoopExit::Stop;
                }
                Ok(_) | Err(TryRecvError::Empty) => {}
            }

            match transport.recv(Some(POLL_INTERVAL)) {
                Ok(datagram) => self.admit(&env, listener_span, datagram),
                Err(RecvError::Timeout) => {}
                Err(RecvError::Closed) => return LoopExit::Closed,
                Err(RecvError::Io(e)) => {
                    self.hub.span_event(
                        &listener_span.span_ref(),
                        "recv_error",
                        &[],
                        &[("error", e.to_string())],
                    );
                    return LoopExit::Fatal(e);
                }
            }
        }
    }

    /// Admission: rate limit, then size check, then a connection span and
    /// the dispatcher. Rejected datagrams drop silently under a counter.
    fn admit(&self, env: &DispatchEnv<H>, listener_span: &Span, datagram: Datagram) {
        self.hub.span_event(
            &listener_span.span_ref(),
            "receiving",
            &[("bytes", datagram.payload.len() as u64)],
            &[],
        );

        if !self.rate_limiter.allow(datagram.source.ip()) {
            self.hub.metrics_table().drop_rate_limited();
            trace!(
                target: "abyss::listener",
                source = %datagram.source,
                "datagram dropped: rate limited"
            );
            return;
        }

        if datagram.payload.len() > self.settings.max_packet_size {
            self.hub.metrics_table().drop_oversize();
            trace!(
                target: "abyss::listener",
                source = %datagram.source,
                bytes = datagram.payload.len(),
                "datagram dropped: over max packet size"
            );
            return;
        }

        let span = self.hub.start_child_span(
            listener_span,
            "connection",
            vec![("source", datagram.source.to_string())],
        );

        if let Err(e) = dispatch(env, span, datagram) {
            error!(
                target: "abyss::connection",
                listener_id = self.id,
                error = %e,
                "dispatch failed"
            );
        }
    }

    /// Bind (or rebind) this listener's transport, retrying until it
    /// succeeds or the pool orders a stop.
    fn acquire_transport(&mut self) -> Option<Arc<dyn Transport>> {
        loop {
            if let Some(transport) = self.prebound.take() {
                return Some(transport);
            }

            match bind_transport(self.bind_addr, &self.transport_options, self.broadcast) {
                Ok(transport) => return Some(transport),
                Err(e) => {
                    error!(
                        target: "abyss::listener",
                        listener_id = self.id,
                        addr = %self.bind_addr,
                        error = %e,
                        "bind failed; retrying"
                    );
                    match self.commands.recv_timeout(REBIND_BACKOFF) {
                        Ok(ListenerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => {
                            return None;
                        }
                        Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                    }
                }
            }
        }
    }

    /// Parked without a socket until the pool resumes or stops us.
    fn await_resume(&self) -> bool {
        loop {
            match self.commands.recv() {
                Ok(ListenerCommand::Resume) => return true,
                Ok(ListenerCommand::Stop) | Err(_) => return false,
                Ok(_) => {}
            }
        }
    }
}
