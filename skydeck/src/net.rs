//! Network transport primitives.
//!
//! The link talks to the simulator through the [`Transport`] seam; the
//! production implementation is the mio-backed [`UdpSocket`].

pub mod endpoint;
#[cfg(test)]
pub(crate) mod memory;
pub mod socket;

use std::io;

pub use endpoint::Endpoint;
pub use socket::UdpSocket;

/// Datagram send/receive used by the telemetry link.
///
/// Receives are non-blocking: `Ok(None)` means nothing is queued.
pub trait Transport: Send {
    /// Sends one datagram to `dest`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error, including `WouldBlock`.
    fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize>;

    /// Receives one datagram if one is queued.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error. `WouldBlock` is mapped to `Ok(None)`.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>>;
}

impl Transport for UdpSocket {
    fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        Self::send_to(self, buf, dest)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        Self::try_recv_from(self, buf)
    }
}
