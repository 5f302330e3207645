//! In-memory transport for unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Endpoint, Transport};
use crate::link::protocol::{Request, decode_request};

#[derive(Default)]
struct Shared {
    sent: Vec<(Endpoint, Vec<u8>)>,
    inbound: VecDeque<(Endpoint, Vec<u8>)>,
    fail_sends: bool,
}

/// Loops datagrams through shared queues. Clones observe the same queues,
/// so a test can keep one clone after handing the other to a link.
#[derive(Clone, Default)]
pub(crate) struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues a datagram for the next `try_recv_from`.
    pub(crate) fn push_inbound(&self, from: Endpoint, datagram: Vec<u8>) {
        self.shared.lock().inbound.push_back((from, datagram));
    }

    /// Makes every subsequent send fail with `ConnectionRefused`.
    pub(crate) fn fail_sends(&self, fail: bool) {
        self.shared.lock().fail_sends = fail;
    }

    /// Drains and decodes everything sent so far.
    pub(crate) fn take_requests(&self) -> Vec<Request> {
        std::mem::take(&mut self.shared.lock().sent)
            .into_iter()
            .map(|(_, bytes)| decode_request(&bytes).unwrap())
            .collect()
    }

    /// Drains the raw datagrams sent so far with their destinations.
    pub(crate) fn take_sent(&self) -> Vec<(Endpoint, Vec<u8>)> {
        std::mem::take(&mut self.shared.lock().sent)
    }
}

impl Transport for MemoryTransport {
    fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        let mut shared = self.shared.lock();
        if shared.fail_sends {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        shared.sent.push((dest, buf.to_vec()));
        Ok(buf.len())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        let Some((from, datagram)) = self.shared.lock().inbound.pop_front() else {
            return Ok(None);
        };
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(Some((len, from)))
    }
}
