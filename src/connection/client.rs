use std::io;
use std::net::SocketAddr;
use std::ops::Deref;

use mio::net::TcpStream;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::connection::Connection;
use crate::buffer::Buffer;

/// An outbound connection: connects to `remote` from `local`.
///
/// Derefs to [`Connection`]; it stays in the connecting phase until the
/// event loop reports that the connect finished.
#[derive(Clone, Debug)]
pub struct ClientConnection {
    connection: Connection,
}

impl ClientConnection {
    /// Start a non-blocking connect. A `local` address with an unspecified
    /// ip and port 0 leaves the choice of source address to the kernel.
    pub fn create(
        remote: SocketAddr,
        local: SocketAddr,
        in_buffer: Buffer,
        out_buffer: Buffer,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        if !(local.ip().is_unspecified() && local.port() == 0) {
            socket.bind(&SockAddr::from(local))?;
        }
        match socket.connect(&SockAddr::from(remote)) {
            Ok(()) => {}
            Err(e) if is_in_progress(&e) => {}
            Err(e) => return Err(e),
        }
        let local = socket
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .unwrap_or(local);
        let stream = TcpStream::from_std(std::net::TcpStream::from(socket));
        stream.set_nodelay(true)?;
        Ok(Self {
            connection: Connection::from_parts(stream, remote, local, in_buffer, out_buffer, true),
        })
    }

    /// The plain connection view of this outbound connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Whether the connect is still in flight.
    pub fn is_connecting(&self) -> bool {
        self.connection.is_connecting()
    }

    /// Complete the connect after writability was reported. `Ok(false)`
    /// means it has not finished yet.
    pub(crate) fn finish_connect(&self) -> io::Result<bool> {
        self.connection.with_stream(|stream| {
            if let Some(e) = stream.take_error()? {
                return Err(e);
            }
            match stream.peer_addr() {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                Err(e) => Err(e),
            }
        })
    }
}

fn is_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}

impl Deref for ClientConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl std::fmt::Display for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.connection.fmt(f)
    }
}
