//! Simulator and local socket addresses.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

/// UDP port the simulator listens on for `RREF`/`CMND` requests.
pub const SIMULATOR_PORT: u16 = 49000;

/// A UDP address. Serializes as `"ip:port"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    #[must_use]
    pub const fn new_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port))
    }

    /// `0.0.0.0:port`, the wildcard bind address.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self::new_v4(0, 0, 0, 0, port)
    }

    /// `127.0.0.1:port`, where a simulator on the same machine listens.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new_v4(127, 0, 0, 1, port)
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Resolves `host:port` (or a literal address) to its first endpoint.
    ///
    /// # Errors
    ///
    /// The resolver error, or `NotFound` when the name yields no addresses.
    pub fn resolve(addr: &str) -> io::Result<Self> {
        addr.to_socket_addrs()?
            .next()
            .map(Self)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {addr}")))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
