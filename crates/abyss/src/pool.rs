//! Supervises the listener threads.
//!
//! Non-broadcast servers get `num_listeners` siblings, each with its own
//! socket bound to the same port through SO_REUSEPORT so the kernel
//! balances traffic across them. Broadcast servers get exactly one. The
//! first socket is bound eagerly so an OS-chosen port (`port = 0`) resolves
//! before the siblings bind, and so bind errors surface from `start`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, unbounded};
use tracing::debug;

use crate::config::{Config, Settings};
use crate::error::Error;
use crate::handler::Handler;
use crate::listener::{Listener, ListenerCommand};
use crate::rate_limit::RateLimiter;
use crate::supervisor::WorkerSupervisor;
use crate::telemetry::TelemetryHub;
use crate::transport::bind_transport;

pub(crate) struct ListenerPool {
    senders: Vec<Sender<ListenerCommand>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl ListenerPool {
    /// Bind the first socket, spawn every listener thread in `Ready` state.
    /// Listeners do not receive until `start_listening`.
    pub(crate) fn start<H: Handler>(
        config: &Config<H>,
        settings: &Arc<Settings>,
        hub: &Arc<TelemetryHub>,
        supervisor: &Arc<WorkerSupervisor>,
        rate_limiter: &Arc<RateLimiter>,
    ) -> Result<Self, Error> {
        let count = if config.broadcast {
            1
        } else {
            config.num_listeners
        };

        let first = bind_transport(
            config.socket_addr(),
            &config.transport_options,
            config.broadcast,
        )?;
        let local_addr = first.local_addr()?;

        let mut senders = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        let mut prebound = Some(first);

        for id in 0..count {
            let (sender, commands) = unbounded();
            let listener = Listener {
                id,
                handler: Arc::clone(&config.handler),
                settings: Arc::clone(settings),
                hub: Arc::clone(hub),
                supervisor: Arc::clone(supervisor),
                rate_limiter: Arc::clone(rate_limiter),
                commands,
                bind_addr: local_addr,
                transport_options: config.transport_options.clone(),
                broadcast: config.broadcast,
                prebound: prebound.take(),
            };

            let thread = std::thread::Builder::new()
                .name(format!("abyss-listener-{id}"))
                .spawn(move || listener.run())
                .map_err(Error::Io)?;

            senders.push(sender);
            threads.push(thread);
        }

        Ok(Self {
            senders,
            threads: Mutex::new(threads),
            local_addr,
        })
    }

    /// The resolved bound address shared by every listener.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.senders.len()
    }

    /// Activation signal: every listener binds (if needed) and starts its
    /// receive loop.
    pub(crate) fn start_listening(&self) {
        self.broadcast_command(|| ListenerCommand::StartListening);
    }

    /// Stop all listeners receiving; their sockets are dropped.
    pub(crate) fn suspend(&self) {
        debug!(target: "abyss::listener", "suspending listeners");
        self.broadcast_command(|| ListenerCommand::Suspend);
    }

    /// Rebind and resume every suspended listener.
    pub(crate) fn resume(&self) {
        debug!(target: "abyss::listener", "resuming listeners");
        self.broadcast_command(|| ListenerCommand::Resume);
    }

    /// Terminate the listener threads and wait for them to exit.
    pub(crate) fn stop(&self) {
        self.broadcast_command(|| ListenerCommand::Stop);

        let threads = std::mem::take(
            &mut *self
                .threads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for thread in threads {
            let _ = thread.join();
        }
    }

    fn broadcast_command(&self, command: impl Fn() -> ListenerCommand) {
        for sender in &self.senders {
            let _ = sender.send(command());
        }
    }
}
