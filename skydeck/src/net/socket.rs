//! The link's datagram socket.
//!
//! A non-blocking [`mio::net::UdpSocket`] with the two operations the
//! telemetry link needs (fire-and-forget sends, drain-until-empty receives)
//! plus receive buffer sizing, which mio leaves to the caller. The bridge
//! loop registers it with its `Poll` through the [`Source`] impl.

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Registry, Token};
use rustix::net::sockopt;

use super::Endpoint;

pub struct UdpSocket {
    inner: MioUdpSocket,
}

impl UdpSocket {
    /// Binds a non-blocking socket. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// The OS error, typically `AddrInUse` or `AddrNotAvailable`.
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        MioUdpSocket::bind(endpoint.as_socket_addr()).map(|inner| Self { inner })
    }

    /// # Errors
    ///
    /// The OS error from `getsockname`.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        Ok(self.inner.local_addr()?.into())
    }

    /// Sends one datagram. Never blocks: a full send buffer is reported as
    /// `WouldBlock`.
    ///
    /// # Errors
    ///
    /// The OS error, `WouldBlock` included.
    pub fn send_to(&self, datagram: &[u8], dest: Endpoint) -> io::Result<usize> {
        self.inner.send_to(datagram, dest.as_socket_addr())
    }

    /// Takes the next queued datagram, `Ok(None)` once the queue is empty.
    ///
    /// # Errors
    ///
    /// Any OS error other than `WouldBlock`.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.inner.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from.into()))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Requests an `SO_RCVBUF` of `bytes`. The kernel may round or double
    /// it; read back with [`recv_buffer_size`](Self::recv_buffer_size).
    ///
    /// # Errors
    ///
    /// The OS error from `setsockopt`.
    pub fn set_recv_buffer_size(&self, bytes: usize) -> io::Result<()> {
        Ok(sockopt::set_socket_recv_buffer_size(self.as_fd(), bytes)?)
    }

    /// # Errors
    ///
    /// The OS error from `getsockopt`.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(sockopt::socket_recv_buffer_size(self.as_fd())?)
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for UdpSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}
