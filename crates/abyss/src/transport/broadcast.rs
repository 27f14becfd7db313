//! Broadcast/multicast transport: SO_BROADCAST enabled, optional multicast
//! group membership. Used by the single listener of broadcast-mode servers
//! (DHCP, mDNS, and similar one-to-many datagram patterns).

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use super::{Datagram, PolledSocket, RecvError, Transport, TransportOptions, TransportStats};
use crate::error::Error;

pub struct BroadcastTransport {
    inner: PolledSocket,
}

impl BroadcastTransport {
    /// Bind a broadcast-capable socket on `addr`. Joins every multicast
    /// group listed in `options` before binding.
    pub fn bind(addr: SocketAddr, options: &TransportOptions) -> Result<Self, Error> {
        let socket = super::new_socket(addr, options)?;
        socket.set_broadcast(true).map_err(Error::Bind)?;

        if let Some(ttl) = options.multicast_ttl {
            socket.set_multicast_ttl_v4(ttl).map_err(Error::Bind)?;
        }
        for (group, interface) in &options.multicast_groups {
            socket
                .join_multicast_v4(group, interface)
                .map_err(Error::Bind)?;
        }

        let inner = super::finish_bind(socket, addr)?;
        Ok(Self { inner })
    }
}

impl Transport for BroadcastTransport {
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
