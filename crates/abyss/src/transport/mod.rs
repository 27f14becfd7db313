//! Datagram transport abstraction.
//!
//! A [`Transport`] owns one bound UDP socket and exposes poll-based receive
//! with timeout, fire-and-forget send, and per-operation counters. Two
//! concrete variants exist:
//!
//! - [`UnicastTransport`]: plain passive-receive socket, broadcast disabled
//! - [`BroadcastTransport`]: SO_BROADCAST enabled, optional multicast group
//!   membership
//!
//! Broadcast mode is inherently single-listener: the OS cannot fan one
//! multicast socket out across N equal receivers without duplicating
//! datagrams, so the pool creates exactly one listener for it.
//!
//! Receive rights belong to the listener that bound the socket; workers share
//! the transport behind an `Arc` for `send` only.

use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Socket, Type};

use crate::error::Error;

pub mod broadcast;
pub mod unicast;

pub use broadcast::BroadcastTransport;
pub use unicast::UnicastTransport;

const READER: Token = Token(0);
/// Maximum size of a UDP datagram; receive buffers are sized to this.
const RECV_BUFFER_SIZE: usize = 65_535;
/// Upper bound on a single poll call so `close` is observed promptly.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// One received UDP datagram. Consumed by exactly one worker.
#[derive(Debug)]
pub struct Datagram {
    pub source: SocketAddr,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

impl Datagram {
    pub fn new(source: SocketAddr, payload: Vec<u8>) -> Self {
        Self {
            source,
            payload,
            received_at: Instant::now(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RecvError {
    #[error("receive timed out")]
    Timeout,

    #[error("socket closed")]
    Closed,

    #[error("receive failed: {0}")]
    Io(#[from] io::Error),
}

/// Options users may set on top of the hardcoded socket flags (nonblocking,
/// reuse-addr, reuse-port, and the per-variant broadcast/multicast flags).
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub multicast_ttl: Option<u32>,
    /// `(group, interface)` pairs joined by the broadcast variant.
    pub multicast_groups: Vec<(std::net::Ipv4Addr, std::net::Ipv4Addr)>,
}

/// Snapshot of a transport's operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub num_recv_syscalls: u64,
    pub num_recv_wouldblock: u64,
    pub num_failed_recvs: u64,
    pub num_send_syscalls: u64,
    pub num_successful_sends: u64,
    pub num_failed_sends: u64,
    pub num_failed_polls: u64,
}

pub trait Transport: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Receive one datagram, waiting at most `timeout` (`None` waits
    /// indefinitely). Only the owning listener may call this.
    fn recv(&self, timeout: Option<Duration>) -> Result<Datagram, RecvError>;

    /// Send a datagram. Safe to call from any thread holding the transport.
    fn send(&self, payload: &[u8], dest: SocketAddr) -> io::Result<()>;

    fn stats(&self) -> TransportStats;

    /// Mark the transport closed. In-progress receives observe the flag
    /// within one poll slice.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Bind the transport variant selected by `broadcast`.
pub(crate) fn bind_transport(
    addr: SocketAddr,
    options: &TransportOptions,
    broadcast: bool,
) -> Result<std::sync::Arc<dyn Transport>, Error> {
    if broadcast {
        Ok(std::sync::Arc::new(BroadcastTransport::bind(addr, options)?))
    } else {
        Ok(std::sync::Arc::new(UnicastTransport::bind(addr, options)?))
    }
}

#[derive(Default)]
struct StatCells {
    num_recv_syscalls: AtomicU64,
    num_recv_wouldblock: AtomicU64,
    num_failed_recvs: AtomicU64,
    num_send_syscalls: AtomicU64,
    num_successful_sends: AtomicU64,
    num_failed_sends: AtomicU64,
    num_failed_polls: AtomicU64,
}

impl StatCells {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            num_recv_syscalls: self.num_recv_syscalls.load(Ordering::Relaxed),
            num_recv_wouldblock: self.num_recv_wouldblock.load(Ordering::Relaxed),
            num_failed_recvs: self.num_failed_recvs.load(Ordering::Relaxed),
            num_send_syscalls: self.num_send_syscalls.load(Ordering::Relaxed),
            num_successful_sends: self.num_successful_sends.load(Ordering::Relaxed),
            num_failed_sends: self.num_failed_sends.load(Ordering::Relaxed),
            num_failed_polls: self.num_failed_polls.load(Ordering::Relaxed),
        }
    }
}

struct Poller {
    poll: Poll,
    events: Events,
}

/// Shared guts of both transport variants: a registered mio socket plus the
/// poll state serialized behind a mutex (only the listener receives, so the
/// lock is uncontended).
pub(crate) struct PolledSocket {
    socket: MioUdpSocket,
    poller: Mutex<Poller>,
    closed: AtomicBool,
    stats: StatCells,
}

impl PolledSocket {
    fn register(socket: MioUdpSocket) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut socket = socket;
        poll.registry()
            .register(&mut socket, READER, Interest::READABLE)?;

        Ok(Self {
            socket,
            poller: Mutex::new(Poller {
                poll,
                events: Events::with_capacity(16),
            }),
            closed: AtomicBool::new(false),
            stats: StatCells::default(),
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn recv(&self, timeout: Option<Duration>) -> Result<Datagram, RecvError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RecvError::Closed);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Poller { poll, events } = &mut *guard;
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(RecvError::Closed);
            }

            self.stats.num_recv_syscalls.fetch_add(1, Ordering::Relaxed);
            match self.socket.recv_from(&mut buf) {
                Ok((nbytes, src_addr)) => {
                    return Ok(Datagram::new(src_addr, buf[..nbytes].to_vec()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.stats
                        .num_recv_wouldblock
                        .fetch_add(1, Ordering::Relaxed);

                    let now = Instant::now();
                    let wait = match deadline {
                        Some(d) if now >= d => return Err(RecvError::Timeout),
                        Some(d) => d.saturating_duration_since(now).min(POLL_SLICE),
                        None => POLL_SLICE,
                    };
                    if poll.poll(events, Some(wait)).is_err() {
                        self.stats.num_failed_polls.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    self.stats.num_failed_recvs.fetch_add(1, Ordering::Relaxed);
                    return Err(RecvError::Io(e));
                }
            }
        }
    }

    fn send(&self, payload: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.stats.num_send_syscalls.fetch_add(1, Ordering::Relaxed);

        if self.closed.load(Ordering::Acquire) {
            self.stats.num_failed_sends.fetch_add(1, Ordering::Relaxed);
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }

        match self.socket.send_to(payload, dest) {
            Ok(_) => {
                self.stats
                    .num_successful_sends
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.num_failed_sends.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Create the raw socket both variants start from: nonblocking with
/// reuse-addr and reuse-port so sibling listeners share one port and the
/// kernel balances traffic across them.
fn new_socket(addr: SocketAddr, options: &TransportOptions) -> Result<Socket, Error> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, None).map_err(Error::Bind)?;
    socket.set_nonblocking(true).map_err(Error::Bind)?;
    socket.set_reuse_address(true).map_err(Error::Bind)?;
    socket.set_reuse_port(true).map_err(Error::Bind)?;

    if let Some(size) = options.recv_buffer_size {
        socket.set_recv_buffer_size(size).map_err(Error::Bind)?;
    }
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size).map_err(Error::Bind)?;
    }

    Ok(socket)
}

fn finish_bind(socket: Socket, addr: SocketAddr) -> Result<PolledSocket, Error> {
    socket.bind(&addr.into()).map_err(Error::Bind)?;
    let std_socket: StdUdpSocket = socket.into();
    let mio_socket = MioUdpSocket::from_std(std_socket);
    PolledSocket::register(mio_socket).map_err(Error::Bind)
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::sync::Arc;

    use super::*;

    fn bind_local(options: &TransportOptions) -> UnicastTransport {
        UnicastTransport::bind("127.0.0.1:0".parse().unwrap(), options).unwrap()
    }

    #[test]
    fn recv_times_out_on_empty_socket() {
        let transport = bind_local(&TransportOptions::default());

        let result = transport.recv(Some(Duration::from_millis(20)));
        assert!(matches!(result, Err(RecvError::Timeout)));
        assert!(transport.stats().num_recv_wouldblock >= 1);
    }

    #[test]
    fn recv_returns_sent_datagram() {
        let transport = bind_local(&TransportOptions::default());
        let addr = transport.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"ping", addr).unwrap();

        let datagram = transport.recv(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(datagram.payload, b"ping");
        assert_eq!(datagram.source, client.local_addr().unwrap());
    }

    #[test]
    fn send_reaches_peer() {
        let transport = bind_local(&TransportOptions::default());

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();

        transport
            .send(b"pong", client.local_addr().unwrap())
            .unwrap();

        let mut buf = [0u8; 16];
        let (nbytes, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..nbytes], b"pong");
        assert_eq!(transport.stats().num_successful_sends, 1);
    }

    #[test]
    fn recv_after_close_is_rejected() {
        let transport = bind_local(&TransportOptions::default());
        transport.close();

        assert!(matches!(transport.recv(None), Err(RecvError::Closed)));
        assert!(transport.is_closed());
    }

    #[test]
    fn send_after_close_counts_a_failure() {
        let transport = bind_local(&TransportOptions::default());
        transport.close();

        let dest = "127.0.0.1:9".parse().unwrap();
        assert!(transport.send(b"late", dest).is_err());
        assert_eq!(transport.stats().num_failed_sends, 1);
    }

    #[test]
    fn broadcast_variant_binds() {
        let transport =
            BroadcastTransport::bind("127.0.0.1:0".parse().unwrap(), &TransportOptions::default())
                .unwrap();
        assert!(transport.local_addr().is_ok());
    }

    #[test]
    fn transports_are_object_safe() {
        let transport: Arc<dyn Transport> =
            Arc::new(bind_local(&TransportOptions::default()));
        assert!(!transport.is_closed());
    }

    #[test]
    fn sibling_listeners_share_a_port() {
        let first = bind_local(&TransportOptions::default());
        let addr = first.local_addr().unwrap();

        let second = UnicastTransport::bind(addr, &TransportOptions::default()).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), addr.port());
    }
}
