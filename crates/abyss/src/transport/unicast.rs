//! Plain unicast transport: passive receive, broadcast disabled.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use super::{Datagram, PolledSocket, RecvError, Transport, TransportOptions, TransportStats};
use crate::error::Error;

pub struct UnicastTransport {
    inner: PolledSocket,
}

impl UnicastTransport {
    /// Bind a unicast socket on `addr` with the hardcoded flags
    /// (nonblocking, reuse-addr, reuse-port) plus any user options.
    pub fn bind(addr: SocketAddr, options: &TransportOptions) -> Result<Self, Error> {
        let socket = super::new_socket(addr, options)?;
        let inner = super::finish_bind(socket, addr)?;
        Ok(Self { inner })
    }
}

impl Transport for UnicastTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn recv(&self, timeout: Option<Duration>) -> Result<Datagram, RecvError> {
        self.inner.recv(timeout)
    }

    fn send(&self, payload: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.inner.send(payload, dest)
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
