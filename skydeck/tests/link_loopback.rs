//! Telemetry link against a fake simulator on loopback UDP.
//!
//! The fake simulator is a plain blocking `std` socket: it decodes whatever
//! the link sends and answers with value datagrams, the way the real
//! simulator does.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=skydeck=debug cargo test --test link_loopback -- --nocapture
//! ```

use std::net::UdpSocket;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use skydeck::link::protocol::{Request, ValueRecord, decode_request, encode_values};
use skydeck::link::{LinkConfig, LivenessCheck, TelemetryLink};
use skydeck::net::Endpoint;
use skydeck::{Frequency, MonoInstant};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(skydeck::trace::init_tracing);
}

/// A blocking socket standing in for the simulator.
struct FakeSimulator {
    socket: UdpSocket,
}

impl FakeSimulator {
    fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind fake simulator");
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        Self { socket }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::from(self.socket.local_addr().unwrap())
    }

    /// Next request and where it came from.
    fn recv(&self) -> (Request, Endpoint) {
        let mut buf = [0u8; 1024];
        let (len, from) = self.socket.recv_from(&mut buf).expect("request");
        (decode_request(&buf[..len]).unwrap(), Endpoint::from(from))
    }

    fn send_values(&self, to: Endpoint, records: &[(i32, f32)]) {
        let mut datagram = Vec::new();
        encode_values(
            records
                .iter()
                .map(|&(index, value)| ValueRecord { index, value }),
            &mut datagram,
        );
        self.socket
            .send_to(&datagram, to.as_socket_addr())
            .unwrap();
    }
}

fn link_to(sim: &FakeSimulator) -> TelemetryLink {
    let config = LinkConfig::default()
        .with_simulator(sim.endpoint())
        .with_bind_addr(Endpoint::localhost(0));
    TelemetryLink::bind(&config, MonoInstant::ZERO).unwrap()
}

/// Pumps the link until `done` holds or two seconds pass.
fn pump_until(link: &mut TelemetryLink, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for values");
        link.pump(MonoInstant::from_millis(10));
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn subscribe_receive_and_close() {
    init_test_tracing();
    let sim = FakeSimulator::bind();
    let mut link = link_to(&sim);

    let (tx, rx) = crossbeam_channel::unbounded();
    let airspeed_tx = tx.clone();
    link.subscribe(
        "sim/cockpit2/gauges/indicators/airspeed_kts_pilot",
        Frequency::new(5),
        move |v| airspeed_tx.send(("airspeed", v)).unwrap(),
    )
    .unwrap();
    link.subscribe(
        "sim/cockpit2/gauges/indicators/altitude_ft_pilot",
        Frequency::new(1),
        move |v| tx.send(("altitude", v)).unwrap(),
    )
    .unwrap();

    let (first, link_addr) = sim.recv();
    assert_eq!(
        first,
        Request::Subscribe {
            frequency: Frequency::new(5),
            index: skydeck::SubscriptionIndex::new(0).unwrap(),
            data_ref: "sim/cockpit2/gauges/indicators/airspeed_kts_pilot".into(),
        }
    );
    assert_eq!(link_addr, link.local_addr().unwrap());
    let (second, _) = sim.recv();
    assert!(matches!(second, Request::Subscribe { index, .. } if index.as_usize() == 1));

    // One datagram, both records, plus a record for an index nobody owns.
    sim.send_values(link_addr, &[(1, 3500.0), (0, 121.5), (9, 1.0)]);
    let mut seen = Vec::new();
    pump_until(&mut link, || {
        seen.extend(rx.try_iter());
        seen.len() == 2
    });
    assert_eq!(seen, [("altitude", 3500.0), ("airspeed", 121.5)]);
    assert!(link.is_active(MonoInstant::from_millis(10)));

    assert_eq!(link.close(), 2);
    let mut unsubscribed = Vec::new();
    for _ in 0..2 {
        match sim.recv().0 {
            Request::Subscribe {
                frequency, index, ..
            } if frequency.is_zero() => unsubscribed.push(index.as_usize()),
            other => panic!("expected unsubscribe, got {other:?}"),
        }
    }
    assert_eq!(unsubscribed, [0, 1]);
    assert!(link.local_addr().is_err());
}

#[test]
fn commands_reach_the_simulator() {
    init_test_tracing();
    let sim = FakeSimulator::bind();
    let mut link = link_to(&sim);

    link.send_command("sim/autopilot/heading_sync").unwrap();
    link.send_command("sim/lights/landing_lights_toggle").unwrap();

    assert_eq!(
        sim.recv().0,
        Request::Command("sim/autopilot/heading_sync".into())
    );
    assert_eq!(
        sim.recv().0,
        Request::Command("sim/lights/landing_lights_toggle".into())
    );
}

#[test]
fn silent_simulator_gets_resubscribed() {
    init_test_tracing();
    let sim = FakeSimulator::bind();
    let mut link = link_to(&sim);

    let last = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&last);
    link.subscribe("sim/flightmodel/position/elevation", Frequency::new(2), move |v| {
        *sink.lock() = Some(v);
    })
    .unwrap();
    let (_, link_addr) = sim.recv();

    // Nothing received by the first check.
    assert_eq!(
        link.poll_liveness(MonoInstant::from_millis(5_000)),
        LivenessCheck::Stale
    );
    assert!(matches!(
        sim.recv().0,
        Request::Subscribe { data_ref, .. } if data_ref == "sim/flightmodel/position/elevation"
    ));

    sim.send_values(link_addr, &[(0, 1234.0)]);
    pump_until(&mut link, || last.lock().is_some());

    // Pumped at 10 ms, so by 10 s the feed has been quiet for far longer
    // than the status timeout.
    assert_eq!(
        link.poll_liveness(MonoInstant::from_millis(10_000)),
        LivenessCheck::Stale
    );
    assert!(matches!(sim.recv().0, Request::Subscribe { .. }));
}
