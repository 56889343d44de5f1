//! Options of a [`Proxy`](super::Proxy) and the policy seams it calls into.

use std::fmt;
use std::sync::Arc;

use crate::connection::{Connection, Connector, Listener, NetEventLoop};
use crate::error::{Error, Result};

/// Picks the backend for an accepted connection.
///
/// Returning `None` refuses the connection; it is closed right away. Called
/// on the accept loop, so it must not block.
pub trait BackendChooser: Send + Sync {
    fn choose(&self, connection: &Connection) -> Option<Connector>;
}

impl<F> BackendChooser for F
where
    F: Fn(&Connection) -> Option<Connector> + Send + Sync,
{
    fn choose(&self, connection: &Connection) -> Option<Connector> {
        self(connection)
    }
}

/// Picks the event loop a new session runs on. `None` means no loop is
/// available and the session is dropped.
pub trait LoopChooser: Send + Sync {
    fn next_loop(&self) -> Option<NetEventLoop>;
}

impl<F> LoopChooser for F
where
    F: Fn() -> Option<NetEventLoop> + Send + Sync,
{
    fn next_loop(&self) -> Option<NetEventLoop> {
        self()
    }
}

/// Everything a proxy needs. Every field is required.
#[derive(Clone, Default)]
pub struct ProxyNetConfig {
    pub(crate) accept_loop: Option<NetEventLoop>,
    pub(crate) loop_chooser: Option<Arc<dyn LoopChooser>>,
    pub(crate) backend_chooser: Option<Arc<dyn BackendChooser>>,
    pub(crate) listener: Option<Listener>,
    pub(crate) in_buffer_size: usize,
    pub(crate) out_buffer_size: usize,
}

impl ProxyNetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The loop the listener is registered on.
    pub fn accept_loop(mut self, event_loop: NetEventLoop) -> Self {
        self.accept_loop = Some(event_loop);
        self
    }

    pub fn loop_chooser(mut self, chooser: impl LoopChooser + 'static) -> Self {
        self.loop_chooser = Some(Arc::new(chooser));
        self
    }

    pub fn backend_chooser(mut self, chooser: impl BackendChooser + 'static) -> Self {
        self.backend_chooser = Some(Arc::new(chooser));
        self
    }

    pub fn listener(mut self, listener: Listener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Size of the buffer holding bytes read from the client.
    pub fn in_buffer_size(mut self, size: usize) -> Self {
        self.in_buffer_size = size;
        self
    }

    /// Size of the buffer holding bytes read from the backend.
    pub fn out_buffer_size(mut self, size: usize) -> Self {
        self.out_buffer_size = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.accept_loop.is_none() {
            return Err(Error::Configuration("no accept loop".into()));
        }
        if self.backend_chooser.is_none() {
            return Err(Error::Configuration("no backend chooser".into()));
        }
        if self.loop_chooser.is_none() {
            return Err(Error::Configuration("no loop chooser".into()));
        }
        if self.listener.is_none() {
            return Err(Error::Configuration("no listener".into()));
        }
        if self.in_buffer_size == 0 {
            return Err(Error::Configuration("in_buffer_size must be greater than 0".into()));
        }
        if self.out_buffer_size == 0 {
            return Err(Error::Configuration("out_buffer_size must be greater than 0".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for ProxyNetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyNetConfig")
            .field("accept_loop", &self.accept_loop)
            .field("loop_chooser", &self.loop_chooser.is_some())
            .field("backend_chooser", &self.backend_chooser.is_some())
            .field("listener", &self.listener)
            .field("in_buffer_size", &self.in_buffer_size)
            .field("out_buffer_size", &self.out_buffer_size)
            .finish()
    }
}
