//! Tests for the connect probe

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};
use tcplb::check::ConnectProbe;
use tcplb::error::{Error, Result};
use tcplb::group::EventLoopGroup;

const WAIT: Duration = Duration::from_secs(5);

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn run_probe(group: &EventLoopGroup, remote: SocketAddr, timeout: Duration) -> Result<()> {
    let probe = ConnectProbe::new(group.next().unwrap(), remote, None, timeout);
    let (tx, rx) = mpsc::channel();
    probe.start(move |result| tx.send(result).unwrap());
    let result = rx.recv_timeout(WAIT).unwrap();
    // exactly once
    assert!(rx.recv_timeout((timeout * 3).max(Duration::from_millis(100))).is_err());
    result
}

/// A listener whose accept queue is full, so new connects hang.
/// `None` when the platform keeps accepting anyway.
fn saturated_listener() -> Option<(Socket, Vec<TcpStream>)> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    socket.bind(&any_port().into()).unwrap();
    socket.listen(1).unwrap();
    let addr = socket.local_addr().unwrap().as_socket().unwrap();

    let mut queued = Vec::new();
    for _ in 0..32 {
        match TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
            Ok(stream) => queued.push(stream),
            Err(_) => return Some((socket, queued)),
        }
    }
    None
}

#[test]
fn test_probe_succeeds_against_listener() {
    let group = EventLoopGroup::new("probe-ok", 1).unwrap();
    let backend = TcpListener::bind(any_port()).unwrap();

    let result = run_probe(&group, backend.local_addr().unwrap(), Duration::from_millis(500));
    assert!(result.is_ok());

    group.close();
}

#[test]
fn test_probe_reports_refused() {
    let group = EventLoopGroup::new("probe-refused", 1).unwrap();
    let addr = TcpListener::bind(any_port()).unwrap().local_addr().unwrap();

    let err = run_probe(&group, addr, Duration::from_millis(500)).unwrap_err();
    assert!(!err.is_timeout());
    assert!(matches!(err, Error::Io(_)));

    group.close();
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_probe_times_out() {
    let Some((listener, _queued)) = saturated_listener() else {
        // test_zero_timeout_always_times_out covers the timer path everywhere
        eprintln!("skipping: the local stack accepted every queued connect");
        return;
    };
    let addr = listener.local_addr().unwrap().as_socket().unwrap();
    let group = EventLoopGroup::new("probe-timeout", 1).unwrap();

    let timeout = Duration::from_millis(100);
    let err = run_probe(&group, addr, timeout).unwrap_err();
    assert!(err.is_timeout());
    assert!(matches!(err, Error::Timeout(t) if t == timeout));
    let selector = group.loops()[0].selector().clone();
    assert!(wait_until(|| selector.registration_count() == 0));

    group.close();
}

#[test]
fn test_zero_timeout_always_times_out() {
    let group = EventLoopGroup::new("zero-timeout", 1).unwrap();
    let backend = TcpListener::bind(any_port()).unwrap();

    // due timers fire before the connect event of the same poll
    let err = run_probe(&group, backend.local_addr().unwrap(), Duration::ZERO).unwrap_err();
    assert!(matches!(err, Error::Timeout(t) if t == Duration::ZERO));
    let selector = group.loops()[0].selector().clone();
    assert!(wait_until(|| selector.registration_count() == 0));

    group.close();
}

#[test]
fn test_stopped_probe_stays_silent() {
    let group = EventLoopGroup::new("probe-stopped", 1).unwrap();
    let backend = TcpListener::bind(any_port()).unwrap();

    let probe = ConnectProbe::new(group.next().unwrap(), backend.local_addr().unwrap(), None, Duration::from_millis(100));
    probe.stop();
    assert!(probe.is_stopped());

    let (tx, rx) = mpsc::channel();
    probe.start(move |result| tx.send(result).unwrap());
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

    group.close();
}

#[test]
fn test_probe_on_closed_loop_fails() {
    let group = EventLoopGroup::new("probe-closed-loop", 1).unwrap();
    let event_loop = group.next().unwrap();
    group.close();

    let backend = TcpListener::bind(any_port()).unwrap();
    let probe = ConnectProbe::new(event_loop, backend.local_addr().unwrap(), None, Duration::from_millis(100));
    let (tx, rx) = mpsc::channel();
    probe.start(move |result| tx.send(result).unwrap());

    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert!(matches!(err, Error::LoopClosed));
}
