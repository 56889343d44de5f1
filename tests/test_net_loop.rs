//! Tests for the net dispatcher: accepting, relaying through buffers and
//! registration rules

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tcplb::buffer::Buffer;
use tcplb::connection::{
    ClientConnection, ClientConnectionHandler, ClientConnectionHandlerContext, Connection,
    ConnectionHandler, ConnectionHandlerContext, Listener, NetEventLoop, ServerHandler,
    ServerHandlerContext,
};
use tcplb::error::Error;
use tcplb::group::EventLoopGroup;

const WAIT: Duration = Duration::from_secs(5);

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
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

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}

/// Closes its connection on any trouble.
struct Echo;

impl ConnectionHandler for Echo {
    fn exception(&mut self, ctx: &ConnectionHandlerContext<'_>, _err: io::Error) {
        ctx.connection.close();
    }

    fn closed(&mut self, _ctx: &ConnectionHandlerContext<'_>) {}

    fn removed(&mut self, ctx: &ConnectionHandlerContext<'_>) {
        ctx.connection.close();
    }
}

/// Registers every accepted connection with one buffer as both input and
/// output, so whatever is read gets written back.
struct EchoServer {
    buffer_size: Option<usize>,
    connections: mpsc::Sender<Connection>,
    removed: Option<mpsc::Sender<()>>,
}

impl ServerHandler for EchoServer {
    fn accept_fail(&mut self, _ctx: &ServerHandlerContext<'_>, _err: io::Error) {}

    fn connection(&mut self, ctx: &ServerHandlerContext<'_>, connection: Connection) {
        ctx.event_loop.add_connection(&connection, Box::new(Echo)).unwrap();
        let _ = self.connections.send(connection);
    }

    fn io_buffers(&mut self, _stream: &mio::net::TcpStream) -> Option<(Buffer, Buffer)> {
        let buffer = Buffer::allocate(self.buffer_size?);
        Some((buffer.clone(), buffer))
    }

    fn removed(&mut self, _ctx: &ServerHandlerContext<'_>) {
        if let Some(removed) = &self.removed {
            let _ = removed.send(());
        }
    }
}

fn echo_server(buffer_size: Option<usize>) -> (EchoServer, mpsc::Receiver<Connection>) {
    let (tx, rx) = mpsc::channel();
    (EchoServer { buffer_size, connections: tx, removed: None }, rx)
}

#[test]
fn test_echo_through_aliased_buffer() {
    let group = EventLoopGroup::new("echo", 1).unwrap();
    let net = group.next().unwrap();
    let listener = Listener::bind(any_port()).unwrap();
    let (server, connections) = echo_server(Some(16));
    net.add_server(&listener, Box::new(server)).unwrap();

    let payload: Vec<u8> = (0..40u8).collect();
    let mut client = connect(listener.local_addr());
    client.write_all(&payload).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).unwrap();
    assert_eq!(echoed, payload);

    let connection = connections.recv_timeout(WAIT).unwrap();
    assert!(wait_until(|| connection.is_closed()));
    assert!(connection.is_remote_closed());
    assert_eq!(connection.from_remote_bytes(), 40);
    assert_eq!(connection.to_remote_bytes(), 40);
    assert_eq!(listener.from_remote_bytes(), 40);
    assert_eq!(listener.to_remote_bytes(), 40);

    group.close();
}

#[test]
fn test_accept_counts_connections() {
    let group = EventLoopGroup::new("accept-count", 1).unwrap();
    let net = group.next().unwrap();
    let listener = Listener::bind(any_port()).unwrap();
    let (server, connections) = echo_server(Some(64));
    net.add_server(&listener, Box::new(server)).unwrap();

    let clients: Vec<TcpStream> = (0..3).map(|_| connect(listener.local_addr())).collect();
    for _ in 0..3 {
        connections.recv_timeout(WAIT).unwrap();
    }
    assert_eq!(listener.history_accepted_connection_count(), 3);

    drop(clients);
    group.close();
}

#[test]
fn test_refused_sockets_are_not_counted() {
    let group = EventLoopGroup::new("accept-refuse", 1).unwrap();
    let net = group.next().unwrap();
    let listener = Listener::bind(any_port()).unwrap();
    let (server, connections) = echo_server(None);
    net.add_server(&listener, Box::new(server)).unwrap();

    let mut client = connect(listener.local_addr());
    let mut buf = [0u8; 1];
    // closed by the proxy side: EOF or reset
    match client.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0),
        Err(e) => assert_ne!(e.kind(), io::ErrorKind::WouldBlock),
    }

    assert_eq!(listener.history_accepted_connection_count(), 0);
    assert!(connections.try_recv().is_err());

    group.close();
}

#[test]
fn test_listener_registers_once() {
    let group = EventLoopGroup::new("listener-once", 1).unwrap();
    let net = group.next().unwrap();
    let listener = Listener::bind(any_port()).unwrap();

    let (first, _rx1) = echo_server(Some(16));
    net.add_server(&listener, Box::new(first)).unwrap();

    let (second, _rx2) = echo_server(Some(16));
    let result = net.add_server(&listener, Box::new(second));
    assert!(matches!(result, Err(Error::AlreadyRegistered(_))));

    group.close();
}

#[test]
fn test_closed_listener_cannot_register() {
    let net = NetEventLoop::open("closed-listener").unwrap();
    let listener = Listener::bind(any_port()).unwrap();
    listener.close();
    assert!(listener.is_closed());

    let (server, _rx) = echo_server(Some(16));
    let result = net.add_server(&listener, Box::new(server));
    assert!(matches!(result, Err(Error::Closed(_))));
    net.selector().close();
}

#[test]
fn test_remove_server_fires_removed() {
    let group = EventLoopGroup::new("remove-server", 1).unwrap();
    let net = group.next().unwrap();
    let listener = Listener::bind(any_port()).unwrap();
    let (removed_tx, removed_rx) = mpsc::channel();
    let (mut server, _rx) = echo_server(Some(16));
    server.removed = Some(removed_tx);
    net.add_server(&listener, Box::new(server)).unwrap();

    net.remove_server(&listener);
    removed_rx.recv_timeout(WAIT).unwrap();
    assert!(listener.event_loop().is_none());

    // free to join another loop once removed
    let (again, _rx) = echo_server(Some(16));
    net.add_server(&listener, Box::new(again)).unwrap();

    group.close();
}

#[test]
fn test_connection_registers_once() {
    let group = EventLoopGroup::new("connection-once", 1).unwrap();
    let net = group.next().unwrap();
    let listener = Listener::bind(any_port()).unwrap();
    let (server, connections) = echo_server(Some(16));
    net.add_server(&listener, Box::new(server)).unwrap();

    let _client = connect(listener.local_addr());
    let connection = connections.recv_timeout(WAIT).unwrap();
    assert!(connection.event_loop().is_some());

    let result = net.add_connection(&connection, Box::new(Echo));
    assert!(matches!(result, Err(Error::AlreadyRegistered(_))));

    connection.close();
    let result = net.add_connection(&connection, Box::new(Echo));
    assert!(matches!(result, Err(Error::Closed(_))));

    group.close();
}

#[test]
fn test_closing_loop_removes_connections() {
    let group = EventLoopGroup::new("loop-close", 1).unwrap();
    let net = group.next().unwrap();
    let listener = Listener::bind(any_port()).unwrap();
    let (server, connections) = echo_server(Some(16));
    net.add_server(&listener, Box::new(server)).unwrap();

    let _client = connect(listener.local_addr());
    let connection = connections.recv_timeout(WAIT).unwrap();

    group.close();
    // Echo closes its connection when removed
    assert!(connection.is_closed());
    assert!(listener.event_loop().is_none());
}

enum ConnectOutcome {
    Connected,
    Failed,
}

struct ConnectWatcher(mpsc::Sender<ConnectOutcome>);

impl ConnectionHandler for ConnectWatcher {
    fn exception(&mut self, ctx: &ConnectionHandlerContext<'_>, _err: io::Error) {
        let _ = self.0.send(ConnectOutcome::Failed);
        ctx.connection.close();
    }

    fn closed(&mut self, _ctx: &ConnectionHandlerContext<'_>) {}

    fn removed(&mut self, _ctx: &ConnectionHandlerContext<'_>) {}
}

impl ClientConnectionHandler for ConnectWatcher {
    fn connected(&mut self, ctx: &ClientConnectionHandlerContext<'_>) {
        let _ = self.0.send(ConnectOutcome::Connected);
        ctx.connection.close();
    }
}

#[test]
fn test_client_connection_reports_connected() {
    let group = EventLoopGroup::new("client-connect", 1).unwrap();
    let net = group.next().unwrap();
    let backend = std::net::TcpListener::bind(any_port()).unwrap();

    let client = ClientConnection::create(
        backend.local_addr().unwrap(),
        any_port(),
        Buffer::allocate(16),
        Buffer::allocate(16),
    )
    .unwrap();
    assert!(client.is_connecting());
    assert_eq!(client.remote(), backend.local_addr().unwrap());

    let (tx, rx) = mpsc::channel();
    net.add_client_connection(&client, Box::new(ConnectWatcher(tx))).unwrap();
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), ConnectOutcome::Connected));
    assert!(!client.is_connecting());

    group.close();
}

#[test]
fn test_client_connection_reports_refused() {
    let group = EventLoopGroup::new("client-refused", 1).unwrap();
    let net = group.next().unwrap();
    let addr = {
        let backend = std::net::TcpListener::bind(any_port()).unwrap();
        backend.local_addr().unwrap()
    };

    let client = match ClientConnection::create(addr, any_port(), Buffer::allocate(16), Buffer::allocate(16)) {
        Ok(client) => client,
        // refused synchronously: nothing left to observe
        Err(e) => {
            assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused);
            group.close();
            return;
        }
    };
    let (tx, rx) = mpsc::channel();
    net.add_client_connection(&client, Box::new(ConnectWatcher(tx))).unwrap();
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), ConnectOutcome::Failed));

    group.close();
}
