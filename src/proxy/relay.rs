//! The proxy engine.
//!
//! Every accepted connection gets an outbound connection whose buffers are
//! the accepted one's, swapped. The outbound side is registered first; the
//! accepted side joins the same loop once the connect succeeded, so both
//! halves of a session are always serviced by one thread.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use mio::net::TcpStream;

use super::config::{BackendChooser, LoopChooser, ProxyNetConfig};
use super::session::Session;
use crate::buffer::Buffer;
use crate::connection::{
    ClientConnectionHandler, ClientConnectionHandlerContext, Connection, ConnectionHandler,
    ConnectionHandlerContext, Listener, NetEventLoop, ServerHandler, ServerHandlerContext,
};
use crate::error::{Error, Result};
use crate::util::lock;

/// Notifications about the proxy as a whole.
pub trait ProxyEventHandler: Send + Sync {
    /// The listener left its accept loop.
    fn server_removed(&self, _server: &Listener) {}
}

impl ProxyEventHandler for () {}

type Sessions = Arc<Mutex<HashMap<u64, Session>>>;

struct Shared {
    accept_loop: NetEventLoop,
    listener: Listener,
    backend_chooser: Arc<dyn BackendChooser>,
    loop_chooser: Arc<dyn LoopChooser>,
    in_buffer_size: usize,
    out_buffer_size: usize,
    handler: Arc<dyn ProxyEventHandler>,
    sessions: Sessions,
}

/// Accepts on a listener and relays each connection to a chosen backend.
pub struct Proxy {
    shared: Arc<Shared>,
}

impl Proxy {
    /// Fails with [`Error::Configuration`] when a required option is
    /// missing or a buffer size is zero.
    pub fn new(config: ProxyNetConfig, handler: impl ProxyEventHandler + 'static) -> Result<Self> {
        config.validate()?;
        let missing = |what: &str| Error::Configuration(format!("no {what}"));
        Ok(Self {
            shared: Arc::new(Shared {
                accept_loop: config.accept_loop.ok_or_else(|| missing("accept loop"))?,
                listener: config.listener.ok_or_else(|| missing("listener"))?,
                backend_chooser: config.backend_chooser.ok_or_else(|| missing("backend chooser"))?,
                loop_chooser: config.loop_chooser.ok_or_else(|| missing("loop chooser"))?,
                in_buffer_size: config.in_buffer_size,
                out_buffer_size: config.out_buffer_size,
                handler: Arc::new(handler),
                sessions: Arc::new(Mutex::new(HashMap::new())),
            }),
        })
    }

    /// Start accepting.
    pub fn handle(&self) -> Result<()> {
        let shared = &self.shared;
        shared
            .accept_loop
            .add_server(&shared.listener, Box::new(SessionServerHandler { shared: Arc::clone(shared) }))?;
        tracing::info!(listen = %shared.listener, "proxy started");
        Ok(())
    }

    /// Stop accepting. Running sessions are left alone.
    pub fn stop(&self) {
        self.shared.accept_loop.remove_server(&self.shared.listener);
    }

    pub fn listener(&self) -> &Listener {
        &self.shared.listener
    }

    /// Sessions that have not reached `Closed` yet.
    pub fn session_count(&self) -> usize {
        lock(&self.shared.sessions).len()
    }

    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = lock(&self.shared.sessions).values().cloned().collect();
        sessions.sort_by_key(Session::id);
        sessions
    }
}

fn close_and_release(connection: &Connection) {
    connection.close();
    connection.in_buffer().clean();
    connection.out_buffer().clean();
}

struct SessionServerHandler {
    shared: Arc<Shared>,
}

impl ServerHandler for SessionServerHandler {
    fn accept_fail(&mut self, ctx: &ServerHandlerContext<'_>, err: io::Error) {
        tracing::error!(server = %ctx.server, error = %err, "accept connection failed");
    }

    fn connection(&mut self, _ctx: &ServerHandlerContext<'_>, connection: Connection) {
        let Some(connector) = self.shared.backend_chooser.choose(&connection) else {
            tracing::info!(conn = %connection, "no backend provided, closing connection");
            close_and_release(&connection);
            return;
        };

        // swapped: what the client sends is what the backend receives
        let passive = match connector.connect(connection.out_buffer().clone(), connection.in_buffer().clone()) {
            Ok(passive) => passive,
            Err(e) => {
                tracing::error!(
                    conn = %connection,
                    backend = %connector.remote(),
                    error = %e,
                    "creating backend connection failed"
                );
                close_and_release(&connection);
                return;
            }
        };

        let session = Session::new(connection, passive);
        lock(&self.shared.sessions).insert(session.id(), session.clone());
        let sessions = Arc::downgrade(&self.shared.sessions);
        session.on_closed(move |session| {
            if let Some(sessions) = sessions.upgrade() {
                lock(&sessions).remove(&session.id());
            }
        });

        let Some(event_loop) = self.shared.loop_chooser.next_loop() else {
            tracing::warn!(session = %session, "no event loop for backend connection");
            session.close();
            return;
        };
        let handler = SessionClientConnectionHandler { session: session.clone() };
        if let Err(e) = event_loop.add_client_connection(session.passive(), Box::new(handler)) {
            tracing::error!(session = %session, error = %e, "registering backend connection failed");
            session.close();
            return;
        }
        tracing::debug!(session = %session, "session created");
    }

    fn io_buffers(&mut self, _stream: &TcpStream) -> Option<(Buffer, Buffer)> {
        Some((
            Buffer::allocate(self.shared.in_buffer_size),
            Buffer::allocate(self.shared.out_buffer_size),
        ))
    }

    fn removed(&mut self, ctx: &ServerHandlerContext<'_>) {
        tracing::info!(server = %ctx.server, "proxy stopped accepting");
        self.shared.handler.server_removed(ctx.server);
    }
}

// The peer of `connection` has finished sending and `connection` flushed
// everything. Close `other` too unless it still owes its own peer bytes; in
// that case stop it from reading so it only drains.
fn half_close(session: &Session, other: &Connection) {
    if session.is_closed() {
        return;
    }
    if other.out_buffer().used() == 0 {
        other.close();
    } else {
        tracing::trace!(session = %session, conn = %other, "draining before close");
        other.in_buffer().close();
    }
}

// Once the other side is gone, `connection` closes as soon as it flushed.
fn close_when_drained(connection: &Connection, other: &Connection) {
    if other.is_closed() && connection.out_buffer().used() == 0 {
        connection.close();
    }
}

fn removed(session: &Session, connection: &Connection) {
    // a connection that closed itself leaves its loop as well; only a
    // forced removal tears down the session
    if !connection.is_closed() {
        tracing::debug!(session = %session, conn = %connection, "connection removed from loop");
        session.close();
    }
}

struct SessionConnectionHandler {
    session: Session,
}

impl ConnectionHandler for SessionConnectionHandler {
    fn writable(&mut self, ctx: &ConnectionHandlerContext<'_>) {
        close_when_drained(ctx.connection, self.session.passive());
    }

    fn exception(&mut self, ctx: &ConnectionHandlerContext<'_>, err: io::Error) {
        tracing::error!(session = %self.session, conn = %ctx.connection, error = %err, "session got exception");
        self.session.close();
    }

    fn closed(&mut self, _ctx: &ConnectionHandlerContext<'_>) {
        half_close(&self.session, self.session.passive());
    }

    fn removed(&mut self, ctx: &ConnectionHandlerContext<'_>) {
        removed(&self.session, ctx.connection);
    }
}

struct SessionClientConnectionHandler {
    session: Session,
}

impl ConnectionHandler for SessionClientConnectionHandler {
    fn writable(&mut self, ctx: &ConnectionHandlerContext<'_>) {
        close_when_drained(ctx.connection, self.session.active());
    }

    fn exception(&mut self, ctx: &ConnectionHandlerContext<'_>, err: io::Error) {
        tracing::error!(session = %self.session, conn = %ctx.connection, error = %err, "session got exception");
        self.session.close();
    }

    fn closed(&mut self, _ctx: &ConnectionHandlerContext<'_>) {
        half_close(&self.session, self.session.active());
    }

    fn removed(&mut self, ctx: &ConnectionHandlerContext<'_>) {
        removed(&self.session, ctx.connection);
    }
}

impl ClientConnectionHandler for SessionClientConnectionHandler {
    fn connected(&mut self, ctx: &ClientConnectionHandlerContext<'_>) {
        tracing::debug!(session = %self.session, "backend connection established");
        let handler = SessionConnectionHandler { session: self.session.clone() };
        if let Err(e) = ctx.event_loop.add_connection(self.session.active(), Box::new(handler)) {
            tracing::error!(session = %self.session, error = %e, "registering client connection failed");
            self.session.close();
        }
    }
}
