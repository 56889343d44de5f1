//! Tests for periodic health checking

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use tcplb::backend::{BackendState, ServerHandle};
use tcplb::check::{HealthCheckClient, HealthCheckConfig, HealthCheckHandler};
use tcplb::error::Error;
use tcplb::group::EventLoopGroup;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Transition {
    Up,
    Down,
}

struct Recorder(Mutex<mpsc::Sender<Transition>>);

impl HealthCheckHandler for Recorder {
    fn up(&self, _remote: SocketAddr) {
        let _ = self.0.lock().unwrap().send(Transition::Up);
    }

    fn down(&self, _remote: SocketAddr, _reason: &Error) {
        let _ = self.0.lock().unwrap().send(Transition::Down);
    }
}

fn fast_config() -> HealthCheckConfig {
    HealthCheckConfig {
        timeout: Duration::from_millis(200),
        period: Duration::from_millis(20),
        up: 2,
        down: 2,
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::Receiver<Transition>) {
    let (tx, rx) = mpsc::channel();
    (Arc::new(Recorder(Mutex::new(tx))), rx)
}

#[test]
fn test_default_config() {
    let config = HealthCheckConfig::default();
    assert_eq!(config.timeout, Duration::from_millis(1000));
    assert_eq!(config.period, Duration::from_millis(5000));
    assert_eq!(config.up, 2);
    assert_eq!(config.down, 3);
}

#[test]
fn test_healthy_target_reports_nothing() {
    let group = EventLoopGroup::new("health-up", 1).unwrap();
    let backend = TcpListener::bind("127.0.0.1:0").unwrap();
    let (handler, transitions) = recorder();

    let client = HealthCheckClient::new(group.next().unwrap(), backend.local_addr().unwrap(), None, fast_config(), handler);
    client.start();

    assert!(transitions.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(client.is_healthy());

    client.stop();
    group.close();
}

#[test]
fn test_unreachable_target_goes_down_then_up() {
    let group = EventLoopGroup::new("health-flap", 1).unwrap();
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let (handler, transitions) = recorder();

    let client = HealthCheckClient::new(group.next().unwrap(), addr, None, fast_config(), handler);
    assert_eq!(client.remote(), addr);
    client.start();

    assert_eq!(transitions.recv_timeout(WAIT).unwrap(), Transition::Down);
    assert!(!client.is_healthy());

    // the port may be taken by now; skip the recovery half then
    let Ok(backend) = TcpListener::bind(addr) else {
        client.stop();
        group.close();
        return;
    };
    assert_eq!(transitions.recv_timeout(WAIT).unwrap(), Transition::Up);
    assert!(client.is_healthy());

    client.stop();
    drop(backend);
    group.close();
}

#[test]
fn test_health_check_marks_server_handle() {
    let group = EventLoopGroup::new("health-handle", 1).unwrap();
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let handle = Arc::new(ServerHandle::new("gone", addr, "0.0.0.0".parse().unwrap()));

    let client = HealthCheckClient::new(group.next().unwrap(), addr, None, fast_config(), handle.clone());
    client.start();

    let deadline = std::time::Instant::now() + WAIT;
    while handle.state() == BackendState::Up && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(handle.state(), BackendState::Down);

    client.stop();
    group.close();
}

#[test]
fn test_stopped_client_reports_nothing() {
    let group = EventLoopGroup::new("health-stop", 1).unwrap();
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let (handler, transitions) = recorder();

    let client = HealthCheckClient::new(group.next().unwrap(), addr, None, fast_config(), handler);
    client.stop();
    client.start();

    assert!(transitions.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(client.is_healthy());

    group.close();
}
