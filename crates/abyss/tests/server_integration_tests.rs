//! End-to-end scenarios over real UDP sockets.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use abyss::config::Config;
use abyss::handler::{Handler, Next, WorkerContext};
use abyss::server::Server;
use abyss::telemetry::RecordingSink;
use abyss::transport::Datagram;

/// Replies with the received payload and stays alive until the idle
/// timeout.
struct Echo;

impl Handler for Echo {
    type State = ();

    fn initial_state(&self, _ctx: &WorkerContext) -> Self::State {}

    fn handle_data(&self, datagram: &Datagram, state: (), ctx: &WorkerContext) -> Next<()> {
        ctx.reply(datagram, &datagram.payload);
        Next::Continue(state)
    }
}

/// Sleeps, echoes, then closes; holds a worker slot open for `sleep`.
struct SleepyEcho {
    sleep: Duration,
}

impl Handler for SleepyEcho {
    type State = ();

    fn initial_state(&self, _ctx: &WorkerContext) -> Self::State {}

    fn handle_data(&self, datagram: &Datagram, state: (), ctx: &WorkerContext) -> Next<()> {
        thread::sleep(self.sleep);
        ctx.reply(datagram, &datagram.payload);
        Next::Close(state)
    }
}

/// Echoes once and closes immediately.
struct OneShotEcho;

impl Handler for OneShotEcho {
    type State = ();

    fn initial_state(&self, _ctx: &WorkerContext) -> Self::State {}

    fn handle_data(&self, datagram: &Datagram, state: (), ctx: &WorkerContext) -> Next<()> {
        ctx.reply(datagram, &datagram.payload);
        Next::Close(state)
    }
}

/// Fails every datagram.
struct AlwaysFails;

impl Handler for AlwaysFails {
    type State = ();

    fn initial_state(&self, _ctx: &WorkerContext) -> Self::State {}

    fn handle_data(&self, _datagram: &Datagram, state: (), _ctx: &WorkerContext) -> Next<()> {
        Next::Fail(state, "induced failure".to_string())
    }
}

fn base_config<H: Handler>(handler: H) -> Config<H> {
    let mut config = Config::new(handler);
    config.interface = "127.0.0.1".parse().unwrap();
    config.port = 0;
    config.num_listeners = 1;
    config.read_timeout = Duration::from_millis(200);
    config.telemetry_sample_rate = 1.0;
    config
}

fn start_with_sink<H: Handler>(mut config: Config<H>) -> (Server, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    config.event_sink = Some(Box::new(Arc::clone(&sink)));
    let server = Server::start(config).expect("server should start");
    (server, sink)
}

fn client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    socket
}

/// Collect replies until `expected` arrive or the deadline passes.
fn recv_replies(socket: &UdpSocket, expected: usize, timeout: Duration) -> Vec<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut replies = Vec::new();
    let mut buf = [0u8; 65_535];

    while replies.len() < expected && Instant::now() < deadline {
        if let Ok((nbytes, _)) = socket.recv_from(&mut buf) {
            replies.push(buf[..nbytes].to_vec());
        }
    }
    replies
}

fn expect_no_reply(socket: &UdpSocket, timeout: Duration) {
    assert!(
        recv_replies(socket, 1, timeout).is_empty(),
        "unexpected reply received"
    );
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn echo_round_trip_single_packet() {
    let (server, _sink) = start_with_sink(base_config(Echo));
    let addr = server.local_addr();

    let socket = client();
    socket.send_to(b"Hello, UDP", addr).unwrap();

    let replies = recv_replies(&socket, 1, Duration::from_secs(1));
    assert_eq!(replies, vec![b"Hello, UDP".to_vec()]);

    // The worker idles out shortly after; counters settle at one
    // connection and one response.
    assert!(wait_for(Duration::from_secs(2), || {
        let m = server.metrics();
        m.connections_total == 1 && m.responses_total == 1 && m.connections_active == 0
    }));
}

#[test]
fn saturation_drops_after_retries_are_exhausted() {
    let mut config = base_config(SleepyEcho {
        sleep: Duration::from_millis(700),
    });
    config.max_workers = Some(1);
    config.retry_count = 0;
    let (server, sink) = start_with_sink(config);
    let addr = server.local_addr();

    let socket = client();
    for _ in 0..5 {
        socket.send_to(b"work", addr).unwrap();
    }

    let replies = recv_replies(&socket, 5, Duration::from_millis(1500));
    assert_eq!(replies.len(), 1, "exactly one datagram should be served");

    assert!(wait_for(Duration::from_secs(1), || {
        sink.count("connection", "limit_exceeded") == 4
    }));
    assert_eq!(server.metrics().connections_total, 1);
}

#[test]
fn rate_limit_caps_admissions_per_source() {
    let mut config = base_config(OneShotEcho);
    config.rate_limit_enabled = true;
    config.rate_limit_max_packets = 3;
    config.rate_limit_window = Duration::from_millis(1000);
    let (server, _sink) = start_with_sink(config);
    let addr = server.local_addr();

    let socket = client();
    for _ in 0..10 {
        socket.send_to(b"burst", addr).unwrap();
    }

    let replies = recv_replies(&socket, 10, Duration::from_millis(800));
    assert_eq!(replies.len(), 3, "only max_packets datagrams reach the handler");
    assert!(wait_for(Duration::from_secs(1), || {
        server.metrics().rate_limited_drops == 7
    }));

    // After a full idle window the bucket refills.
    thread::sleep(Duration::from_millis(1100));
    socket.send_to(b"again", addr).unwrap();
    let replies = recv_replies(&socket, 1, Duration::from_secs(1));
    assert_eq!(replies.len(), 1);
}

#[test]
fn oversize_packets_drop_silently() {
    let mut config = base_config(OneShotEcho);
    config.max_packet_size = 100;
    let (server, _sink) = start_with_sink(config);
    let addr = server.local_addr();

    let socket = client();
    socket.send_to(&[0u8; 150], addr).unwrap();
    expect_no_reply(&socket, Duration::from_millis(300));

    assert!(wait_for(Duration::from_secs(1), || {
        server.metrics().oversize_drops == 1
    }));
    assert_eq!(server.metrics().connections_total, 0);

    socket.send_to(&[0u8; 50], addr).unwrap();
    let replies = recv_replies(&socket, 1, Duration::from_secs(1));
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].len(), 50);
}

#[test]
fn graceful_shutdown_drains_in_flight_workers() {
    let mut config = base_config(SleepyEcho {
        sleep: Duration::from_millis(200),
    });
    config.max_workers = Some(64);
    let (server, _sink) = start_with_sink(config);
    let addr = server.local_addr();

    let socket = client();
    for _ in 0..50 {
        socket.send_to(b"drain me", addr).unwrap();
    }

    // Every datagram has entered the worker pipeline before stop begins.
    assert!(wait_for(Duration::from_secs(5), || {
        server.metrics().connections_total == 50
    }));

    let drained = server.stop(Duration::from_secs(2));
    assert!(drained, "all workers should finish within the drain budget");
    assert_eq!(server.metrics().responses_total, 50);

    let replies = recv_replies(&socket, 50, Duration::from_secs(1));
    assert_eq!(replies.len(), 50, "every admitted datagram gets its echo");

    // Nothing is admitted once stop has begun.
    socket.send_to(b"too late", addr).unwrap();
    expect_no_reply(&socket, Duration::from_millis(300));
    assert_eq!(server.metrics().connections_total, 50);
}

#[test]
fn suspend_parks_listeners_and_resume_restores_them() {
    let (server, _sink) = start_with_sink(base_config(OneShotEcho));
    let addr = server.local_addr();

    let socket = client();
    socket.send_to(b"before", addr).unwrap();
    assert_eq!(recv_replies(&socket, 1, Duration::from_secs(1)).len(), 1);

    server.suspend();
    // Give the listener a full poll slice to observe the command.
    thread::sleep(Duration::from_millis(500));

    socket.send_to(b"while suspended", addr).unwrap();
    expect_no_reply(&socket, Duration::from_millis(500));

    server.resume();
    assert_eq!(server.local_addr(), addr, "resume rebinds the same port");

    // The rebind races the send; retry a few times.
    let mut replied = false;
    for _ in 0..5 {
        socket.send_to(b"after", addr).unwrap();
        if !recv_replies(&socket, 1, Duration::from_millis(400)).is_empty() {
            replied = true;
            break;
        }
    }
    assert!(replied, "resumed listener should serve datagrams again");
}

#[test]
fn stopping_twice_is_a_no_op() {
    let (server, _sink) = start_with_sink(base_config(OneShotEcho));

    assert!(server.stop(Duration::from_secs(1)));
    assert!(server.is_stopped());
    assert!(server.stop(Duration::from_secs(1)));
}

#[test]
fn zero_worker_cap_drops_every_datagram_after_retries() {
    let mut config = base_config(OneShotEcho);
    config.max_workers = Some(0);
    config.retry_count = 2;
    config.retry_base_wait = Duration::from_millis(20);
    let (server, sink) = start_with_sink(config);
    let addr = server.local_addr();

    let socket = client();
    for _ in 0..3 {
        socket.send_to(b"doomed", addr).unwrap();
    }

    expect_no_reply(&socket, Duration::from_millis(500));
    assert!(wait_for(Duration::from_secs(1), || {
        sink.count("connection", "limit_exceeded") == 3
    }));

    let exhausted = sink
        .events()
        .into_iter()
        .find(|e| e.event == "limit_exceeded")
        .unwrap();
    assert!(
        exhausted
            .measurements
            .contains(&("retries_attempted", 2))
    );
    assert_eq!(server.metrics().connections_total, 0);
}

#[test]
fn slow_handler_does_not_trip_the_idle_timeout() {
    // Handler runs 3x longer than read_timeout; the timeout applies to
    // inter-event idleness, not handler duration.
    let mut config = base_config(SleepyEcho {
        sleep: Duration::from_millis(300),
    });
    config.read_timeout = Duration::from_millis(100);
    let (server, _sink) = start_with_sink(config);
    let addr = server.local_addr();

    let socket = client();
    socket.send_to(b"slow", addr).unwrap();

    let replies = recv_replies(&socket, 1, Duration::from_secs(1));
    assert_eq!(replies.len(), 1);
}

#[test]
fn handler_failure_terminates_silently_when_configured() {
    let mut config = base_config(AlwaysFails);
    config.silent_terminate_on_error = true;
    let (server, sink) = start_with_sink(config);
    let addr = server.local_addr();

    let socket = client();
    socket.send_to(b"oops", addr).unwrap();
    expect_no_reply(&socket, Duration::from_millis(300));

    assert!(wait_for(Duration::from_secs(1), || {
        server.metrics().connections_active == 0 && server.metrics().connections_total == 1
    }));

    assert!(wait_for(Duration::from_secs(1), || {
        sink.events().iter().any(|e| {
            e.span_name == "connection"
                && e.event == "stop"
                && e.metadata
                    .iter()
                    .any(|(k, v)| *k == "reason" && v == "handler_error")
                && e.metadata
                    .iter()
                    .any(|(k, v)| *k == "silent_termination" && v == "true")
        })
    }));
}

#[test]
fn broadcast_mode_serves_single_shot_workers() {
    let mut config = base_config(Echo);
    config.broadcast = true;
    config.num_listeners = 8; // ignored in broadcast mode
    let (server, sink) = start_with_sink(config);
    let addr = server.local_addr();

    let socket = client();
    socket.send_to(b"anyone there?", addr).unwrap();

    let replies = recv_replies(&socket, 1, Duration::from_secs(1));
    assert_eq!(replies, vec![b"anyone there?".to_vec()]);

    // Broadcast workers terminate right after the handler, no idle wait.
    assert!(wait_for(Duration::from_secs(1), || {
        server.metrics().connections_active == 0
    }));
    assert!(wait_for(Duration::from_secs(1), || {
        sink.events().iter().any(|e| {
            e.event == "stop"
                && e.metadata
                    .iter()
                    .any(|(k, v)| *k == "reason" && v == "broadcast")
        })
    }));
}

#[test]
fn sibling_listeners_share_one_port() {
    let mut config = base_config(OneShotEcho);
    config.num_listeners = 4;
    let (server, _sink) = start_with_sink(config);
    let addr: SocketAddr = server.local_addr();

    let socket = client();
    for i in 0..12u8 {
        socket.send_to(&[i; 8], addr).unwrap();
    }

    let replies = recv_replies(&socket, 12, Duration::from_secs(2));
    assert_eq!(replies.len(), 12);
}
