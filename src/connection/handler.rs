//! Callback roles of the net dispatcher.
//!
//! Handlers carry no per-event state of their own; whatever they need
//! (usually a session) is captured when they are created, and the context
//! passed to every callback names the loop and the socket involved.

use std::io;

use mio::net::TcpStream;

use super::client::ClientConnection;
use super::connection::Connection;
use super::listener::Listener;
use super::net_loop::NetEventLoop;
use crate::buffer::Buffer;

pub struct ServerHandlerContext<'a> {
    pub event_loop: &'a NetEventLoop,
    pub server: &'a Listener,
}

pub struct ConnectionHandlerContext<'a> {
    pub event_loop: &'a NetEventLoop,
    pub connection: &'a Connection,
}

pub struct ClientConnectionHandlerContext<'a> {
    pub event_loop: &'a NetEventLoop,
    pub connection: &'a ClientConnection,
}

/// Callbacks of a listener registration.
pub trait ServerHandler: Send {
    /// Accepting failed. The listener stays registered.
    fn accept_fail(&mut self, ctx: &ServerHandlerContext<'_>, err: io::Error);

    /// A new connection was accepted. It is not registered to any loop yet.
    fn connection(&mut self, ctx: &ServerHandlerContext<'_>, connection: Connection);

    /// Buffers for a freshly accepted socket as `(in, out)`. `None` refuses
    /// the socket, which is then closed without being wrapped.
    fn io_buffers(&mut self, stream: &TcpStream) -> Option<(Buffer, Buffer)>;

    fn removed(&mut self, ctx: &ServerHandlerContext<'_>);
}

/// Callbacks of a connection registration.
pub trait ConnectionHandler: Send {
    /// Bytes were stored into the input buffer.
    fn readable(&mut self, _ctx: &ConnectionHandlerContext<'_>) {}

    /// Bytes were drained from the output buffer.
    fn writable(&mut self, _ctx: &ConnectionHandlerContext<'_>) {}

    /// Reading, writing or connecting failed. The connection is left open;
    /// the handler decides what to close.
    fn exception(&mut self, ctx: &ConnectionHandlerContext<'_>, err: io::Error);

    /// The peer finished sending and every buffered byte was flushed, so
    /// the connection has been closed.
    fn closed(&mut self, ctx: &ConnectionHandlerContext<'_>);

    /// The connection left its event loop.
    fn removed(&mut self, ctx: &ConnectionHandlerContext<'_>);
}

/// Callbacks of an outbound connection registration.
pub trait ClientConnectionHandler: ConnectionHandler {
    /// The connect completed; read and write interest are now in place.
    fn connected(&mut self, ctx: &ClientConnectionHandlerContext<'_>);
}
