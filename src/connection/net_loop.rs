use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use super::client::ClientConnection;
use super::connection::Connection;
use super::handler::{
    ClientConnectionHandler, ClientConnectionHandlerContext, ConnectionHandler,
    ConnectionHandlerContext, ServerHandler, ServerHandlerContext,
};
use super::listener::Listener;
use crate::error::Result;
use crate::selector::{Handler, HandlerContext, Ops, SelectorEventLoop};
use crate::util::lock;

/// Binds listeners and connections to a [`SelectorEventLoop`] and pumps
/// bytes between their sockets and buffers.
///
/// Clones share one table of the connections registered through them, so
/// wrap a selector once and clone the wrapper.
#[derive(Clone)]
pub struct NetEventLoop {
    selector: SelectorEventLoop,
    connections: Arc<Mutex<HashMap<u64, Connection>>>,
}

impl NetEventLoop {
    pub fn new(selector: SelectorEventLoop) -> Self {
        Self {
            selector,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a fresh selector loop and wrap it.
    pub fn open(name: impl Into<String>) -> Result<Self> {
        Ok(Self::new(SelectorEventLoop::open(name)?))
    }

    pub fn selector(&self) -> &SelectorEventLoop {
        &self.selector
    }

    pub fn ptr_eq(&self, other: &NetEventLoop) -> bool {
        self.selector.ptr_eq(&other.selector)
    }

    /// Connections currently registered on this loop, ordered by sequence
    /// number.
    pub fn connections(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> = lock(&self.connections).values().cloned().collect();
        connections.sort_by_key(Connection::seq);
        connections
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Start accepting on `server`.
    pub fn add_server(&self, server: &Listener, handler: Box<dyn ServerHandler>) -> Result<()> {
        server.bind_loop(&self.selector)?;
        let dispatch = ServerDispatch {
            net: self.clone(),
            server: server.clone(),
            handler,
        };
        match self.selector.add(server.channel(), Ops::ACCEPT, Box::new(dispatch)) {
            Ok(token) => {
                server.bound(token);
                Ok(())
            }
            Err(e) => {
                server.unbind();
                Err(e)
            }
        }
    }

    /// Stop accepting on `server`. The handler's `removed` fires later on
    /// the loop thread.
    pub fn remove_server(&self, server: &Listener) {
        if let Some(token) = server.token() {
            self.selector.remove(token);
        }
    }

    /// Register an established connection. Read interest is set when the
    /// input buffer has room, write interest when output is pending.
    pub fn add_connection(
        &self,
        connection: &Connection,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<()> {
        connection.bind(&self.selector)?;
        let dispatch = ConnectionDispatch {
            net: self.clone(),
            connection: connection.clone(),
            handler,
        };
        let result = self.selector.add(connection.channel(), data_ops(connection), Box::new(dispatch));
        self.finish_add(connection, result)
    }

    /// Register an outbound connection. Its handler's `connected` fires on
    /// the loop thread once the connect completes.
    pub fn add_client_connection(
        &self,
        connection: &ClientConnection,
        handler: Box<dyn ClientConnectionHandler>,
    ) -> Result<()> {
        connection.bind(&self.selector)?;
        let dispatch = ClientDispatch {
            net: self.clone(),
            connection: connection.clone(),
            handler,
        };
        let result = self.selector.add(connection.channel(), Ops::CONNECT, Box::new(dispatch));
        self.finish_add(connection, result)
    }

    /// Take a connection out of this loop without closing it.
    pub fn remove_connection(&self, connection: &Connection) {
        if let Some(token) = connection.binding_token() {
            self.selector.remove(token);
        }
    }

    fn finish_add(&self, connection: &Connection, result: Result<mio::Token>) -> Result<()> {
        match result {
            Ok(token) => {
                // listed before `bound`, which may already queue the removal
                lock(&self.connections).insert(connection.seq(), connection.clone());
                connection.bound(token);
                // buffer edges that fired before the token was known were dropped
                if !connection.is_connecting() && !connection.is_closed() {
                    let ops = data_ops(connection);
                    if !ops.is_empty() {
                        self.selector.add_ops(token, ops);
                    }
                }
                Ok(())
            }
            Err(e) => {
                connection.unbind();
                Err(e)
            }
        }
    }
}

impl fmt::Debug for NetEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetEventLoop")
            .field("selector", &self.selector)
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn data_ops(connection: &Connection) -> Ops {
    let mut ops = Ops::NONE;
    if connection.in_buffer().free() > 0 && !connection.is_remote_closed() {
        ops |= Ops::READ;
    }
    if connection.out_buffer().used() > 0 {
        ops |= Ops::WRITE;
    }
    ops
}

struct ServerDispatch {
    net: NetEventLoop,
    server: Listener,
    handler: Box<dyn ServerHandler>,
}

impl Handler for ServerDispatch {
    fn accept(&mut self, ctx: &HandlerContext<'_>) {
        let sctx = ServerHandlerContext { event_loop: &self.net, server: &self.server };
        loop {
            let (stream, remote) = match self.server.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(server = %self.server, error = %e, "accept failed");
                    self.handler.accept_fail(&sctx, e);
                    return;
                }
            };
            let Some((in_buffer, out_buffer)) = self.handler.io_buffers(&stream) else {
                tracing::debug!(server = %self.server, %remote, "no buffers for accepted socket, closing it");
                drop(stream);
                continue;
            };
            let connection = match Connection::new(stream, in_buffer, out_buffer) {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::warn!(server = %self.server, %remote, error = %e, "wrapping accepted socket failed");
                    continue;
                }
            };
            connection.add_net_flow_recorder(self.server.recorder());
            self.server.inc_accepted();
            tracing::trace!(server = %self.server, conn = %connection, "accepted");
            self.handler.connection(&sctx, connection);
        }
    }

    fn removed(&mut self, ctx: &HandlerContext<'_>) {
        self.server.release_binding(ctx.token());
        let sctx = ServerHandlerContext { event_loop: &self.net, server: &self.server };
        self.handler.removed(&sctx);
    }
}

struct ConnectionDispatch {
    net: NetEventLoop,
    connection: Connection,
    handler: Box<dyn ConnectionHandler>,
}

impl Handler for ConnectionDispatch {
    fn readable(&mut self, ctx: &HandlerContext<'_>) {
        on_readable(&mut *self.handler, ctx, &self.net, &self.connection);
    }

    fn writable(&mut self, ctx: &HandlerContext<'_>) {
        on_writable(&mut *self.handler, ctx, &self.net, &self.connection);
    }

    fn removed(&mut self, ctx: &HandlerContext<'_>) {
        on_removed(&mut *self.handler, ctx, &self.net, &self.connection);
    }
}

struct ClientDispatch {
    net: NetEventLoop,
    connection: ClientConnection,
    handler: Box<dyn ClientConnectionHandler>,
}

impl Handler for ClientDispatch {
    fn connected(&mut self, ctx: &HandlerContext<'_>) {
        let net = &self.net;
        match self.connection.finish_connect() {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(conn = %self.connection, "connect still in progress");
                return;
            }
            Err(e) => {
                let cctx = ConnectionHandlerContext { event_loop: net, connection: &self.connection };
                self.handler.exception(&cctx, e);
                return;
            }
        }
        self.connection.set_connecting(false);
        ctx.modify(data_ops(&self.connection));
        tracing::trace!(conn = %self.connection, "connected");
        let cctx = ClientConnectionHandlerContext { event_loop: net, connection: &self.connection };
        self.handler.connected(&cctx);
    }

    fn readable(&mut self, ctx: &HandlerContext<'_>) {
        on_readable(&mut *self.handler, ctx, &self.net, &self.connection);
    }

    fn writable(&mut self, ctx: &HandlerContext<'_>) {
        on_writable(&mut *self.handler, ctx, &self.net, &self.connection);
    }

    fn removed(&mut self, ctx: &HandlerContext<'_>) {
        on_removed(&mut *self.handler, ctx, &self.net, &self.connection);
    }
}

fn on_readable<H>(
    handler: &mut H,
    ctx: &HandlerContext<'_>,
    net: &NetEventLoop,
    connection: &Connection,
) where
    H: ConnectionHandler + ?Sized,
{
    let cctx = ConnectionHandlerContext { event_loop: net, connection };

    if connection.in_buffer().free() == 0 {
        if connection.in_buffer().is_closed() {
            tracing::debug!(conn = %connection, "input buffer closed, stop reading");
        } else {
            tracing::warn!(conn = %connection, "readable fired with a full input buffer");
        }
        ctx.rm_ops(Ops::READ);
        return;
    }
    let stored = match connection.store_from_remote() {
        Ok(stored) => stored,
        Err(e) => {
            handler.exception(&cctx, e);
            return;
        }
    };
    if stored.bytes > 0 {
        connection.record_from_remote(stored.bytes);
        handler.readable(&cctx);
    }
    if stored.eof {
        tracing::trace!(conn = %connection, "remote closed");
        connection.mark_remote_closed();
        // whatever is still buffered gets flushed before the close
        ctx.modify(Ops::WRITE);
        return;
    }
    if stored.bytes == 0 {
        tracing::debug!(conn = %connection, "read nothing");
        return;
    }
    if connection.in_buffer().free() == 0 {
        tracing::trace!(conn = %connection, "input buffer full, remove READ");
        ctx.rm_ops(Ops::READ);
    }
}

fn on_writable<H>(
    handler: &mut H,
    ctx: &HandlerContext<'_>,
    net: &NetEventLoop,
    connection: &Connection,
) where
    H: ConnectionHandler + ?Sized,
{
    let cctx = ConnectionHandlerContext { event_loop: net, connection };

    if connection.out_buffer().used() == 0 {
        if connection.is_remote_closed() {
            connection.close();
            handler.closed(&cctx);
        } else {
            tracing::debug!(conn = %connection, "nothing to write");
            ctx.rm_ops(Ops::WRITE);
        }
        return;
    }
    let written = match connection.write_to_remote() {
        Ok(written) => written,
        Err(e) => {
            handler.exception(&cctx, e);
            return;
        }
    };
    if written == 0 {
        tracing::debug!(conn = %connection, "wrote nothing");
        return;
    }
    connection.record_to_remote(written);
    handler.writable(&cctx);
    if connection.is_closed() || connection.out_buffer().used() > 0 {
        return;
    }
    if connection.is_remote_closed() {
        // no further writable edge arrives on an idle socket
        connection.close();
        handler.closed(&cctx);
    } else {
        tracing::trace!(conn = %connection, "output buffer empty, remove WRITE");
        ctx.rm_ops(Ops::WRITE);
    }
}

fn on_removed<H>(
    handler: &mut H,
    ctx: &HandlerContext<'_>,
    net: &NetEventLoop,
    connection: &Connection,
) where
    H: ConnectionHandler + ?Sized,
{
    if connection.release_binding(ctx.token()) {
        lock(&net.connections).remove(&connection.seq());
    }
    let cctx = ConnectionHandlerContext { event_loop: net, connection };
    handler.removed(&cctx);
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::buffer::Buffer;
    use crate::group::EventLoopGroup;

    struct Idle;

    impl ConnectionHandler for Idle {
        fn exception(&mut self, ctx: &ConnectionHandlerContext<'_>, _err: io::Error) {
            ctx.connection.close();
        }

        fn closed(&mut self, _ctx: &ConnectionHandlerContext<'_>) {}

        fn removed(&mut self, _ctx: &ConnectionHandlerContext<'_>) {}
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn accepted_pair() -> (TcpStream, mio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, mio::net::TcpStream::from_std(server))
    }

    #[test]
    fn test_full_input_buffer_pauses_reading_until_drained() {
        let group = EventLoopGroup::new("backpressure", 1).unwrap();
        let net = group.next().unwrap();
        let (mut client, stream) = accepted_pair();
        let connection = Connection::new(stream, Buffer::allocate(4), Buffer::allocate(4)).unwrap();
        net.add_connection(&connection, Box::new(Idle)).unwrap();
        let token = connection.binding_token().unwrap();

        let payload: Vec<u8> = (0..100u8).collect();
        client.write_all(&payload).unwrap();

        assert!(wait_until(|| {
            connection.in_buffer().used() == 4
                && net.selector().ops(token).is_some_and(|ops| !ops.contains(Ops::READ))
        }));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(connection.from_remote_bytes(), 4);

        // each drain re-arms READ, so the rest of the payload trickles in
        let mut received = Vec::new();
        let mut chunk = [0u8; 4];
        assert!(wait_until(|| {
            let n = connection.in_buffer().fetch(&mut chunk);
            received.extend_from_slice(&chunk[..n]);
            received.len() == payload.len()
        }));
        assert_eq!(received, payload);
        assert_eq!(connection.from_remote_bytes(), 100);

        group.close();
    }

    #[test]
    fn test_connections_are_listed_while_registered() {
        let group = EventLoopGroup::new("listing", 1).unwrap();
        let net = group.next().unwrap();
        let (_first_client, first) = accepted_pair();
        let (_second_client, second) = accepted_pair();
        let first = Connection::new(first, Buffer::allocate(16), Buffer::allocate(16)).unwrap();
        let second = Connection::new(second, Buffer::allocate(16), Buffer::allocate(16)).unwrap();
        net.add_connection(&second, Box::new(Idle)).unwrap();
        net.add_connection(&first, Box::new(Idle)).unwrap();

        let listed: Vec<u64> = net.connections().iter().map(Connection::seq).collect();
        assert_eq!(listed, vec![first.seq(), second.seq()]);
        assert_eq!(group.next().unwrap().connection_count(), 2);

        first.close();
        assert!(wait_until(|| net.connection_count() == 1));
        assert!(net.connections()[0].ptr_eq(&second));

        net.remove_connection(&second);
        assert!(wait_until(|| net.connection_count() == 0));
        assert!(!second.is_closed());

        second.close();
        group.close();
    }
}
