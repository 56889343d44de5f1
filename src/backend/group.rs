//! Backend group management
//!
//! A group holds the backends of one service and picks the next healthy
//! one for every new connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use super::handle::ServerHandle;
use crate::connection::{Connection, Connector};
use crate::error::{Error, Result};
use crate::proxy::BackendChooser;
use crate::util::{read, write};

struct GroupInner {
    name: String,
    servers: RwLock<Vec<Arc<ServerHandle>>>,
    current_index: AtomicUsize,
}

/// Pool of backend servers
#[derive(Clone)]
pub struct ServerGroup {
    inner: Arc<GroupInner>,
}

impl ServerGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                name: name.into(),
                servers: RwLock::new(Vec::new()),
                current_index: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a backend. Aliases are unique within a group.
    pub fn add(&self, alias: impl Into<String>, remote: SocketAddr, local: IpAddr) -> Result<Arc<ServerHandle>> {
        let alias = alias.into();
        let mut servers = write(&self.inner.servers);
        if servers.iter().any(|s| s.alias == alias) {
            return Err(Error::Configuration(format!("backend {alias} already exists in {}", self.inner.name)));
        }
        let handle = Arc::new(ServerHandle::new(alias, remote, local));
        servers.push(Arc::clone(&handle));
        tracing::info!(group = %self.inner.name, backend = %handle.alias, %remote, "backend added");
        Ok(handle)
    }

    /// Remove a backend. Its open connections are left alone.
    pub fn remove(&self, alias: &str) -> Option<Arc<ServerHandle>> {
        let mut servers = write(&self.inner.servers);
        let index = servers.iter().position(|s| s.alias == alias)?;
        let handle = servers.remove(index);
        tracing::info!(group = %self.inner.name, backend = %handle.alias, "backend removed");
        Some(handle)
    }

    /// Get all backends (for monitoring/debugging)
    pub fn servers(&self) -> Vec<Arc<ServerHandle>> {
        read(&self.inner.servers).clone()
    }

    /// Get count of available backends
    pub fn available_count(&self) -> usize {
        read(&self.inner.servers).iter().filter(|s| s.is_available()).count()
    }

    /// Select the next available backend using round-robin
    ///
    /// Returns None if no backends are available
    pub fn next(&self) -> Option<Arc<ServerHandle>> {
        let servers = read(&self.inner.servers);
        if servers.is_empty() {
            return None;
        }
        let start = self.inner.current_index.fetch_add(1, Ordering::Relaxed);
        for offset in 0..servers.len() {
            let server = &servers[(start + offset) % servers.len()];
            if server.is_available() {
                if offset > 0 {
                    self.inner.current_index.fetch_add(offset, Ordering::Relaxed);
                }
                return Some(Arc::clone(server));
            }
        }
        tracing::error!(group = %self.inner.name, "No available backends in group");
        None
    }

    /// A connector to the next available backend
    pub fn connector(&self) -> Option<Connector> {
        self.next().map(|server| server.connector())
    }
}

impl BackendChooser for ServerGroup {
    fn choose(&self, _connection: &Connection) -> Option<Connector> {
        self.connector()
    }
}

impl std::fmt::Debug for ServerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerGroup")
            .field("name", &self.inner.name)
            .field("servers", &read(&self.inner.servers).len())
            .finish()
    }
}
