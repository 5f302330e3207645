//! Telemetry link: the simulator-facing UDP client.
//!
//! # Architecture
//!
//! ```text
//!   subscribe / send_command / close          pump (readable)
//!               │                                   │
//!               ▼                                   ▼
//!   ┌───────────────────────┐   RREF\0 / CMND\0   ┌───────────┐
//!   │     TelemetryLink     │ ──────────────────> │ simulator │
//!   │  SubscriptionTable    │ <────────────────── │  :49000   │
//!   │  LivenessMonitor      │      RREF, values   └───────────┘
//!   └───────────────────────┘
//!               │ handler(value) per record
//!               ▼
//!        render cells / callers
//! ```
//!
//! The link is owned by one thread (the bridge loop). It never blocks:
//! sends are fire-and-forget, receives drain whatever is queued, and the
//! liveness check is polled against the caller's clock.
//!
//! Failures are absorbed. Foreign datagrams, out-of-range indices and send
//! errors are logged and dropped; the only recovery is the liveness check
//! resubscribing everything once the stream goes quiet.

pub mod liveness;
pub mod protocol;
pub mod table;

use std::io;
use std::mem;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::endpoint::SIMULATOR_PORT;
use crate::net::{Endpoint, Transport, UdpSocket};
use crate::runtime::timing::MonoInstant;
use crate::trace::{debug, info, trace, warn};

pub use liveness::{LivenessCheck, LivenessMonitor};
pub use protocol::{Frequency, ProtocolError, SubscriptionIndex};
pub use table::{Subscription, SubscriptionTable, ValueHandler};

/// Receive buffer size. Larger than any UDP payload.
const RECV_BUF_LEN: usize = 64 * 1024;

/// Errors surfaced by the telemetry link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Binding the local socket failed. Not retried.
    #[error("failed to bind telemetry socket")]
    Bind(#[source] io::Error),
    #[error("failed to configure telemetry socket")]
    SocketOption(#[source] io::Error),
    /// The request can't be encoded (name too long or contains NUL).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// No wire index left for another subscription.
    #[error("subscription table is full")]
    TableFull,
    #[error("telemetry link is closed")]
    Closed,
}

/// Telemetry link configuration.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use skydeck::link::LinkConfig;
/// use skydeck::net::Endpoint;
///
/// let config = LinkConfig::default()
///     .with_simulator(Endpoint::new_v4(192, 168, 1, 20, 49000))
///     .with_status_timeout(Duration::from_millis(1500));
/// assert_eq!(config.check_interval, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Where requests are sent.
    pub simulator: Endpoint,
    /// Local bind address. Port 0 picks an ephemeral port.
    pub bind_addr: Endpoint,
    /// Period of the liveness check.
    pub check_interval: Duration,
    /// A datagram younger than this counts as "receiving".
    pub status_timeout: Duration,
    /// `SO_RCVBUF` override; `None` keeps the OS default.
    pub recv_buffer_size: Option<usize>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            simulator: Endpoint::localhost(SIMULATOR_PORT),
            bind_addr: Endpoint::any(0),
            check_interval: Duration::from_millis(5000),
            status_timeout: Duration::from_millis(1000),
            recv_buffer_size: None,
        }
    }
}

impl LinkConfig {
    #[must_use]
    pub const fn with_simulator(mut self, simulator: Endpoint) -> Self {
        self.simulator = simulator;
        self
    }

    #[must_use]
    pub const fn with_bind_addr(mut self, bind_addr: Endpoint) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    #[must_use]
    pub const fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }
}

/// Outbound half: transport, destination and a reusable encode buffer.
struct Outbound<T> {
    transport: Option<T>,
    simulator: Endpoint,
    buf: Vec<u8>,
}

impl<T: Transport> Outbound<T> {
    fn send_subscribe(
        &mut self,
        frequency: Frequency,
        index: SubscriptionIndex,
        data_ref: &str,
    ) -> bool {
        match protocol::encode_subscribe(frequency, index, data_ref, &mut self.buf) {
            Ok(()) => self.transmit(),
            Err(_e) => {
                warn!(index = %index, error = %_e, "unencodable subscribe request");
                false
            }
        }
    }

    /// Hands the encoded buffer to the transport. Failures are logged only.
    fn transmit(&self) -> bool {
        let Some(transport) = &self.transport else {
            return false;
        };
        match transport.send_to(&self.buf, self.simulator) {
            Ok(_) => true,
            Err(_e) => {
                warn!(dest = %self.simulator, error = %_e, "send failed");
                false
            }
        }
    }
}

/// UDP client for the simulator's subscription protocol.
pub struct TelemetryLink<T: Transport = UdpSocket> {
    out: Outbound<T>,
    table: SubscriptionTable,
    liveness: LivenessMonitor,
    recv_buf: Vec<u8>,
}

impl TelemetryLink<UdpSocket> {
    /// Binds a UDP socket per `config` and arms the liveness check.
    ///
    /// # Errors
    ///
    /// [`LinkError::Bind`] if the socket can't be bound,
    /// [`LinkError::SocketOption`] if the receive buffer can't be sized.
    pub fn bind(config: &LinkConfig, now: MonoInstant) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(config.bind_addr).map_err(LinkError::Bind)?;
        if let Some(size) = config.recv_buffer_size {
            socket
                .set_recv_buffer_size(size)
                .map_err(LinkError::SocketOption)?;
        }
        info!(
            local = ?socket.local_addr().ok(),
            simulator = %config.simulator,
            "telemetry link bound"
        );
        Ok(Self::with_transport(socket, config, now))
    }

    /// Local address of the socket.
    ///
    /// # Errors
    ///
    /// `NotConnected` after [`close`](Self::close), otherwise the OS error.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.out
            .transport
            .as_ref()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
            .and_then(UdpSocket::local_addr)
    }
}

impl<T: Transport> TelemetryLink<T> {
    /// Builds a link over an already-open transport.
    #[must_use]
    pub fn with_transport(transport: T, config: &LinkConfig, now: MonoInstant) -> Self {
        Self {
            out: Outbound {
                transport: Some(transport),
                simulator: config.simulator,
                buf: Vec::with_capacity(protocol::SUBSCRIBE_REQUEST_LEN),
            },
            table: SubscriptionTable::new(),
            liveness: LivenessMonitor::new(config.check_interval, config.status_timeout, now),
            recv_buf: vec![0; RECV_BUF_LEN],
        }
    }

    /// Registers `handler` for `data_ref` at the next index and asks the
    /// simulator to start sending it at `frequency`.
    ///
    /// Subscribing the same data reference twice creates two independent
    /// entries.
    ///
    /// # Errors
    ///
    /// [`LinkError::Protocol`] if `data_ref` can't be encoded (checked before
    /// the table changes), [`LinkError::Closed`] after [`close`](Self::close).
    pub fn subscribe(
        &mut self,
        data_ref: impl Into<String>,
        frequency: Frequency,
        handler: impl FnMut(f32) + Send + 'static,
    ) -> Result<SubscriptionIndex, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        let data_ref = data_ref.into();
        protocol::validate_data_ref(&data_ref)?;

        let index = self
            .table
            .push(data_ref, frequency, Box::new(handler))
            .ok_or(LinkError::TableFull)?;
        if let Some(sub) = self.table.get(index) {
            debug!(index = %index, data_ref = sub.data_ref(), frequency = %frequency, "subscribe");
            self.out.send_subscribe(frequency, index, sub.data_ref());
        }
        Ok(index)
    }

    /// Re-sends the subscribe request of every entry, in index order.
    ///
    /// Returns the number of requests handed to the transport.
    pub fn resubscribe_all(&mut self) -> usize {
        let mut sent = 0;
        for sub in self.table.iter() {
            if self.out.send_subscribe(sub.frequency(), sub.index(), sub.data_ref()) {
                sent += 1;
            }
        }
        sent
    }

    /// Triggers a simulator command once. Delivery isn't confirmed.
    ///
    /// # Errors
    ///
    /// [`LinkError::Protocol`] if `command` contains NUL,
    /// [`LinkError::Closed`] after [`close`](Self::close).
    pub fn send_command(&mut self, command: &str) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        protocol::encode_command(command, &mut self.out.buf)?;
        debug!(command, "command");
        self.out.transmit();
        Ok(())
    }

    /// Processes one inbound datagram.
    ///
    /// Returns the number of handlers invoked. Foreign datagrams and records
    /// with unknown indices are logged and dropped.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: MonoInstant) -> usize {
        let records = match protocol::decode_values(datagram) {
            Ok(records) => records,
            Err(_e) => {
                debug!(len = datagram.len(), error = %_e, "ignoring datagram");
                return 0;
            }
        };
        self.liveness.record_datagram(now);

        let mut dispatched = 0;
        for record in records {
            match self.table.lookup_mut(record.index) {
                Some(sub) => {
                    sub.deliver(record.value);
                    dispatched += 1;
                }
                None => {
                    warn!(
                        index = record.index,
                        subscriptions = self.table.len(),
                        "value for unknown subscription"
                    );
                }
            }
        }
        dispatched
    }

    /// Drains every datagram currently queued on the transport.
    ///
    /// Returns the number of datagrams read.
    pub fn pump(&mut self, now: MonoInstant) -> usize {
        let mut buf = mem::take(&mut self.recv_buf);
        let mut received = 0;
        while let Some(transport) = &self.out.transport {
            match transport.try_recv_from(&mut buf) {
                Ok(Some((len, _from))) => {
                    trace!(len, from = %_from, "datagram");
                    self.handle_datagram(&buf[..len], now);
                    received += 1;
                }
                Ok(None) => break,
                Err(_e) => {
                    warn!(error = %_e, "receive failed");
                    break;
                }
            }
        }
        self.recv_buf = buf;
        received
    }

    /// Runs the liveness check if due, resubscribing everything when no
    /// datagram arrived within the status timeout.
    pub fn poll_liveness(&mut self, now: MonoInstant) -> LivenessCheck {
        let check = self.liveness.poll(now);
        if check == LivenessCheck::Stale {
            let _sent = self.resubscribe_all();
            info!(
                resubscribed = _sent,
                last_received = ?self.liveness.last_received_at(),
                "telemetry stale, resubscribing"
            );
        }
        check
    }

    /// Unsubscribes every entry, clears the table, cancels the liveness
    /// check and releases the transport.
    ///
    /// Returns the number of unsubscribe requests sent. Calling it again is
    /// a no-op returning 0.
    pub fn close(&mut self) -> usize {
        let mut sent = 0;
        for sub in self.table.iter() {
            if self
                .out
                .send_subscribe(Frequency::UNSUBSCRIBE, sub.index(), sub.data_ref())
            {
                sent += 1;
            }
        }
        self.table.clear();
        self.liveness.cancel();
        if self.out.transport.take().is_some() {
            info!(unsubscribed = sent, "telemetry link closed");
        }
        sent
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.out.transport.is_none()
    }

    /// `true` when a values datagram arrived within the status timeout.
    #[must_use]
    pub fn is_active(&self, now: MonoInstant) -> bool {
        self.liveness.is_active(now)
    }

    #[must_use]
    pub const fn last_received_at(&self) -> Option<MonoInstant> {
        self.liveness.last_received_at()
    }

    /// When [`poll_liveness`](Self::poll_liveness) next has work.
    #[must_use]
    pub const fn next_deadline(&self) -> Option<MonoInstant> {
        self.liveness.next_deadline()
    }

    #[must_use]
    pub fn subscription(&self, index: SubscriptionIndex) -> Option<&Subscription> {
        self.table.get(index)
    }

    #[must_use]
    pub fn last_value(&self, index: SubscriptionIndex) -> Option<f32> {
        self.table.get(index).and_then(Subscription::last_value)
    }

    pub fn subscriptions(&self) -> impl ExactSizeIterator<Item = &Subscription> {
        self.table.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    #[must_use]
    pub const fn simulator(&self) -> Endpoint {
        self.out.simulator
    }

    /// The transport, until [`close`](Self::close).
    pub const fn transport_mut(&mut self) -> Option<&mut T> {
        self.out.transport.as_mut()
    }
}

impl<T: Transport> Drop for TelemetryLink<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::protocol::{Request, ValueRecord, encode_values};
    use super::*;
    use crate::net::memory::MemoryTransport;

    const SIM: Endpoint = Endpoint::localhost(SIMULATOR_PORT);

    fn at(ms: u64) -> MonoInstant {
        MonoInstant::from_millis(ms)
    }

    fn link() -> (TelemetryLink<MemoryTransport>, MemoryTransport) {
        let transport = MemoryTransport::new();
        let link = TelemetryLink::with_transport(transport.clone(), &LinkConfig::default(), at(0));
        (link, transport)
    }

    fn values(records: &[(i32, f32)]) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_values(
            records
                .iter()
                .map(|&(index, value)| ValueRecord { index, value }),
            &mut buf,
        );
        buf
    }

    fn subscribe_request(hz: u16, index: u32, data_ref: &str) -> Request {
        Request::Subscribe {
            frequency: Frequency::new(hz),
            index: SubscriptionIndex::new(index).unwrap(),
            data_ref: data_ref.into(),
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<f32>>>, impl FnMut(f32) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v| sink.lock().push(v))
    }

    #[test]
    fn subscribe_assigns_dense_indices_and_sends_request() {
        let (mut link, transport) = link();
        let a = link.subscribe("sim/a", Frequency::new(10), |_| {}).unwrap();
        let b = link.subscribe("sim/b", Frequency::new(2), |_| {}).unwrap();
        // Duplicates are independent entries.
        let c = link.subscribe("sim/a", Frequency::new(1), |_| {}).unwrap();

        assert_eq!([a, b, c].map(SubscriptionIndex::as_usize), [0, 1, 2]);
        assert_eq!(
            transport.take_requests(),
            vec![
                subscribe_request(10, 0, "sim/a"),
                subscribe_request(2, 1, "sim/b"),
                subscribe_request(1, 2, "sim/a"),
            ]
        );
    }

    #[test]
    fn requests_go_to_configured_simulator() {
        let (mut link, transport) = link();
        link.send_command("sim/lights/landing_lights_on").unwrap();
        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, SIM);
        assert_eq!(sent[0].1, b"CMND\0sim/lights/landing_lights_on\0");
    }

    #[test]
    fn unencodable_data_ref_leaves_table_untouched() {
        let (mut link, transport) = link();
        let err = link
            .subscribe("x".repeat(400), Frequency::new(1), |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::Protocol(ProtocolError::DataRefTooLong { .. })
        ));
        assert!(link.is_empty());
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn datagram_dispatches_each_record_to_its_handler() {
        let (mut link, _transport) = link();
        let (first, h0) = recorder();
        let (second, h1) = recorder();
        link.subscribe("sim/a", Frequency::new(10), h0).unwrap();
        link.subscribe("sim/b", Frequency::new(10), h1).unwrap();

        let dispatched = link.handle_datagram(&values(&[(1, 2.5), (0, -1.0), (1, 3.0)]), at(40));
        assert_eq!(dispatched, 3);
        assert_eq!(*first.lock(), vec![-1.0]);
        assert_eq!(*second.lock(), vec![2.5, 3.0]);
        assert_eq!(link.last_received_at(), Some(at(40)));
        assert_eq!(link.last_value(SubscriptionIndex::new(1).unwrap()), Some(3.0));
    }

    #[test]
    fn foreign_datagram_changes_nothing() {
        let (mut link, _transport) = link();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        link.subscribe("sim/a", Frequency::new(10), move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        let mut bogus = values(&[(0, 1.0)]);
        bogus[4] = b'!';
        assert_eq!(link.handle_datagram(&bogus, at(10)), 0);
        assert_eq!(link.handle_datagram(b"RRE", at(10)), 0);

        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert_eq!(link.last_received_at(), None);
        assert_eq!(link.last_value(SubscriptionIndex::new(0).unwrap()), None);
    }

    #[test]
    fn out_of_range_indices_are_dropped() {
        let (mut link, _transport) = link();
        let (seen, handler) = recorder();
        link.subscribe("sim/a", Frequency::new(10), handler).unwrap();

        let dispatched = link.handle_datagram(&values(&[(1, 9.0), (-3, 9.0), (0, 4.0)]), at(5));
        assert_eq!(dispatched, 1);
        assert_eq!(*seen.lock(), vec![4.0]);
        // Still counts as a valid datagram for liveness.
        assert_eq!(link.last_received_at(), Some(at(5)));
    }

    #[test]
    fn pump_drains_transport() {
        let (mut link, transport) = link();
        let (seen, handler) = recorder();
        link.subscribe("sim/a", Frequency::new(10), handler).unwrap();

        transport.push_inbound(SIM, values(&[(0, 1.0)]));
        transport.push_inbound(SIM, b"garbage".to_vec());
        transport.push_inbound(SIM, values(&[(0, 2.0)]));

        assert_eq!(link.pump(at(100)), 3);
        assert_eq!(link.pump(at(101)), 0);
        assert_eq!(*seen.lock(), vec![1.0, 2.0]);
    }

    #[test]
    fn silent_link_resubscribes_in_index_order() {
        let (mut link, transport) = link();
        for name in ["sim/a", "sim/b", "sim/c"] {
            link.subscribe(name, Frequency::new(10), |_| {}).unwrap();
        }
        transport.take_sent();

        assert_eq!(link.poll_liveness(at(4_999)), LivenessCheck::NotDue);
        assert_eq!(link.poll_liveness(at(5_000)), LivenessCheck::Stale);
        assert_eq!(
            transport.take_requests(),
            vec![
                subscribe_request(10, 0, "sim/a"),
                subscribe_request(10, 1, "sim/b"),
                subscribe_request(10, 2, "sim/c"),
            ]
        );
    }

    #[test]
    fn recent_values_suppress_resubscribe() {
        let (mut link, transport) = link();
        link.subscribe("sim/a", Frequency::new(10), |_| {}).unwrap();
        transport.take_sent();

        link.handle_datagram(&values(&[(0, 1.0)]), at(4_500));
        assert_eq!(link.poll_liveness(at(5_000)), LivenessCheck::Active);
        assert!(transport.take_sent().is_empty());
        assert_eq!(link.next_deadline(), Some(at(10_000)));

        // Quiet since 4.5 s: the next check resubscribes.
        assert_eq!(link.poll_liveness(at(10_000)), LivenessCheck::Stale);
        assert_eq!(transport.take_requests().len(), 1);
    }

    #[test]
    fn send_failures_are_absorbed() {
        let (mut link, transport) = link();
        transport.fail_sends(true);
        let index = link.subscribe("sim/a", Frequency::new(10), |_| {}).unwrap();
        assert_eq!(index.as_usize(), 0);
        assert!(link.send_command("sim/none").is_ok());
        assert_eq!(link.resubscribe_all(), 0);
    }

    #[test]
    fn close_unsubscribes_with_original_indices_once() {
        let (mut link, transport) = link();
        for name in ["sim/a", "sim/b", "sim/c"] {
            link.subscribe(name, Frequency::new(10), |_| {}).unwrap();
        }
        transport.take_sent();

        assert_eq!(link.close(), 3);
        assert_eq!(
            transport.take_requests(),
            vec![
                subscribe_request(0, 0, "sim/a"),
                subscribe_request(0, 1, "sim/b"),
                subscribe_request(0, 2, "sim/c"),
            ]
        );
        assert!(link.is_empty());
        assert!(link.is_closed());
        assert_eq!(link.next_deadline(), None);

        assert_eq!(link.close(), 0);
        assert!(transport.take_sent().is_empty());
        assert!(matches!(
            link.subscribe("sim/d", Frequency::new(1), |_| {}),
            Err(LinkError::Closed)
        ));
    }

    #[test]
    fn drop_closes_link() {
        let (mut link, transport) = link();
        link.subscribe("sim/a", Frequency::new(10), |_| {}).unwrap();
        transport.take_sent();

        drop(link);
        assert_eq!(
            transport.take_requests(),
            vec![subscribe_request(0, 0, "sim/a")]
        );
    }

    #[test]
    fn bind_ephemeral_udp() {
        let config = LinkConfig::default().with_bind_addr(Endpoint::localhost(0));
        let link = TelemetryLink::bind(&config, at(0)).unwrap();
        assert_ne!(link.local_addr().unwrap().port(), 0);
        assert_eq!(link.simulator(), SIM);
    }

    #[test]
    fn config_builder() {
        let config = LinkConfig::default()
            .with_check_interval(Duration::from_secs(2))
            .with_recv_buffer_size(1 << 20);
        assert_eq!(config.check_interval, Duration::from_secs(2));
        assert_eq!(config.status_timeout, Duration::from_secs(1));
        assert_eq!(config.recv_buffer_size, Some(1 << 20));
        assert_eq!(config.bind_addr, Endpoint::any(0));
    }
}
