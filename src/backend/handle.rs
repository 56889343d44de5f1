//! Backend server handles
//!
//! A handle identifies one backend endpoint and keeps its live accounting:
//! health, open connections and bytes exchanged. Counters are updated from
//! event loop threads and read from anywhere, so they are atomics.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::check::HealthCheckHandler;
use crate::connection::{ConnCloseHandler, Connection, Connector, ConnectorHooks, NetFlowRecorder};
use crate::error::Error;
use crate::util::lock;

/// Represents the current state of a backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Backend is healthy and receives new connections
    Up,
    /// Backend failed its health checks
    Down,
}

/// A backend endpoint with its accounting.
pub struct ServerHandle {
    /// Name used in logs and listings
    pub alias: String,

    /// Backend address
    pub remote: SocketAddr,

    /// Source address outbound connections are bound to
    pub local: IpAddr,

    healthy: AtomicBool,
    from_remote_bytes: AtomicU64,
    to_remote_bytes: AtomicU64,
    connections: Mutex<HashMap<u64, Connection>>,
}

impl ServerHandle {
    pub fn new(alias: impl Into<String>, remote: SocketAddr, local: IpAddr) -> Self {
        Self {
            alias: alias.into(),
            remote,
            local,
            healthy: AtomicBool::new(true),
            from_remote_bytes: AtomicU64::new(0),
            to_remote_bytes: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> BackendState {
        if self.is_available() { BackendState::Up } else { BackendState::Down }
    }

    /// Check if backend may receive new connections
    pub fn is_available(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Mark backend as failed
    pub fn mark_down(&self) {
        if self.healthy.swap(false, Ordering::AcqRel) {
            tracing::warn!(backend = %self.alias, remote = %self.remote, "Backend marked as down");
        }
    }

    /// Mark backend as recovered
    pub fn mark_up(&self) {
        if !self.healthy.swap(true, Ordering::AcqRel) {
            tracing::info!(backend = %self.alias, remote = %self.remote, "Backend recovered");
        }
    }

    /// Live connections to this backend
    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn connections(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> = lock(&self.connections).values().cloned().collect();
        connections.sort_by_key(Connection::seq);
        connections
    }

    /// Bytes received from the backend
    pub fn from_remote_bytes(&self) -> u64 {
        self.from_remote_bytes.load(Ordering::Relaxed)
    }

    /// Bytes sent to the backend
    pub fn to_remote_bytes(&self) -> u64 {
        self.to_remote_bytes.load(Ordering::Relaxed)
    }

    /// A connector whose connections are accounted to this handle.
    pub fn connector(self: &Arc<Self>) -> Connector {
        let hooks: Arc<dyn ConnectorHooks> = Arc::clone(self) as Arc<dyn ConnectorHooks>;
        Connector::with_hooks(self.remote, SocketAddr::new(self.local, 0), hooks)
    }
}

impl ConnectorHooks for ServerHandle {
    fn attached(self: Arc<Self>, connection: &Connection) {
        connection.add_net_flow_recorder(Arc::clone(&self) as Arc<dyn NetFlowRecorder>);
        connection.add_conn_close_handler(Arc::clone(&self) as Arc<dyn ConnCloseHandler>);
        lock(&self.connections).insert(connection.seq(), connection.clone());
    }
}

impl NetFlowRecorder for ServerHandle {
    fn inc_from_remote_bytes(&self, bytes: u64) {
        self.from_remote_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn inc_to_remote_bytes(&self, bytes: u64) {
        self.to_remote_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl ConnCloseHandler for ServerHandle {
    fn on_connection_close(&self, connection: &Connection) {
        lock(&self.connections).remove(&connection.seq());
    }
}

impl HealthCheckHandler for ServerHandle {
    fn up(&self, _remote: SocketAddr) {
        self.mark_up();
    }

    fn down(&self, _remote: SocketAddr, reason: &Error) {
        tracing::debug!(backend = %self.alias, reason = %reason, "health check reported down");
        self.mark_down();
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("alias", &self.alias)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}
