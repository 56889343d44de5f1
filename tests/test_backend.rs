//! Tests for backend group management

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tcplb::backend::{BackendState, ServerGroup, ServerHandle};
use tcplb::check::HealthCheckHandler;
use tcplb::error::Error;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn any_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn group_of(ports: &[u16]) -> (ServerGroup, Vec<Arc<ServerHandle>>) {
    let group = ServerGroup::new("test");
    let handles = ports
        .iter()
        .map(|port| group.add(format!("backend-{port}"), addr(*port), any_ip()).unwrap())
        .collect();
    (group, handles)
}

#[test]
fn test_backend_creation() {
    let handle = ServerHandle::new("backend-1", addr(3000), any_ip());
    assert_eq!(handle.alias, "backend-1");
    assert_eq!(handle.remote, addr(3000));
    assert!(handle.is_available());
    assert_eq!(handle.state(), BackendState::Up);
    assert_eq!(handle.connection_count(), 0);
}

#[test]
fn test_backend_down_and_recovery() {
    let handle = ServerHandle::new("backend-1", addr(3000), any_ip());

    handle.mark_down();
    assert!(!handle.is_available());
    assert_eq!(handle.state(), BackendState::Down);

    // repeated marks are harmless
    handle.mark_down();
    assert_eq!(handle.state(), BackendState::Down);

    handle.mark_up();
    assert!(handle.is_available());
    assert_eq!(handle.state(), BackendState::Up);
}

#[test]
fn test_health_reports_drive_backend_state() {
    let handle = ServerHandle::new("backend-1", addr(3000), any_ip());
    let reason = Error::Timeout(std::time::Duration::from_millis(100));

    handle.down(addr(3000), &reason);
    assert_eq!(handle.state(), BackendState::Down);

    handle.up(addr(3000));
    assert_eq!(handle.state(), BackendState::Up);
}

#[test]
fn test_connector_targets_backend() {
    let local = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let handle = Arc::new(ServerHandle::new("backend-1", addr(3000), local));
    let connector = handle.connector();
    assert_eq!(connector.remote(), addr(3000));
    assert_eq!(connector.local(), SocketAddr::new(local, 0));
}

#[test]
fn test_group_creation() {
    let (group, _) = group_of(&[3000, 3001]);
    assert_eq!(group.name(), "test");
    assert_eq!(group.servers().len(), 2);
    assert_eq!(group.available_count(), 2);
}

#[test]
fn test_group_rejects_duplicate_alias() {
    let group = ServerGroup::new("test");
    group.add("backend", addr(3000), any_ip()).unwrap();
    let result = group.add("backend", addr(3001), any_ip());
    assert!(matches!(result, Err(Error::Configuration(_))));
    assert_eq!(group.servers().len(), 1);
}

#[test]
fn test_group_round_robin_selection() {
    let (group, _) = group_of(&[3000, 3001]);

    let first = group.next().unwrap();
    let second = group.next().unwrap();
    let third = group.next().unwrap();

    assert_eq!(first.remote, addr(3000));
    assert_eq!(second.remote, addr(3001));
    assert_eq!(third.remote, addr(3000)); // Wraps around
}

#[test]
fn test_group_skips_unavailable() {
    let (group, handles) = group_of(&[3000, 3001, 3002]);
    handles[1].mark_down();

    let picked: Vec<SocketAddr> = (0..3).map(|_| group.next().unwrap().remote).collect();
    assert_eq!(picked, vec![addr(3000), addr(3002), addr(3000)]);
    assert_eq!(group.available_count(), 2);
}

#[test]
fn test_group_no_available_backends() {
    let (group, handles) = group_of(&[3000]);
    handles[0].mark_down();

    assert!(group.next().is_none());
    assert!(group.connector().is_none());
    assert_eq!(group.available_count(), 0);

    handles[0].mark_up();
    assert_eq!(group.available_count(), 1);
    assert!(group.connector().is_some());
}

#[test]
fn test_group_remove() {
    let (group, _) = group_of(&[3000, 3001]);

    let removed = group.remove("backend-3000").unwrap();
    assert_eq!(removed.remote, addr(3000));
    assert!(group.remove("backend-3000").is_none());

    for _ in 0..3 {
        assert_eq!(group.next().unwrap().remote, addr(3001));
    }
}

#[test]
fn test_empty_group() {
    let group = ServerGroup::new("empty");
    assert!(group.next().is_none());
    assert_eq!(group.available_count(), 0);
}
