use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use super::client::ClientConnection;
use super::connection::Connection;
use crate::buffer::Buffer;

/// Accounting attached to every connection a [`Connector`] creates.
pub trait ConnectorHooks: Send + Sync {
    /// A connection was created for this target. Implementations usually
    /// install themselves as flow recorder and close handler.
    fn attached(self: Arc<Self>, connection: &Connection);
}

/// Factory of outbound connections to one `remote`, always bound to the
/// same `local` address.
#[derive(Clone)]
pub struct Connector {
    remote: SocketAddr,
    local: SocketAddr,
    hooks: Option<Arc<dyn ConnectorHooks>>,
}

impl Connector {
    pub fn new(remote: SocketAddr, local: SocketAddr) -> Self {
        Self { remote, local, hooks: None }
    }

    pub fn with_hooks(remote: SocketAddr, local: SocketAddr, hooks: Arc<dyn ConnectorHooks>) -> Self {
        Self { remote, local, hooks: Some(hooks) }
    }

    /// Connect from any local address.
    pub fn to(remote: SocketAddr) -> Self {
        Self::new(remote, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Start connecting with the given buffers.
    pub fn connect(&self, in_buffer: Buffer, out_buffer: Buffer) -> io::Result<ClientConnection> {
        let connection = ClientConnection::create(self.remote, self.local, in_buffer, out_buffer)?;
        if let Some(hooks) = &self.hooks {
            Arc::clone(hooks).attached(&connection);
        }
        Ok(connection)
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}
