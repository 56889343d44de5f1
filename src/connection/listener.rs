use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::connection::{Binding, NetFlowRecorder};
use crate::error::{Error, Result};
use crate::selector::{Channel, SelectorEventLoop};
use crate::util::lock;

const LISTEN_BACKLOG: i32 = 1024;

struct ListenerInner {
    addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    closed: AtomicBool,
    binding: Mutex<Option<Binding>>,
    accepted: AtomicU64,
    from_remote_bytes: AtomicU64,
    to_remote_bytes: AtomicU64,
}

/// A bound, listening TCP socket.
///
/// Byte flow of every connection it accepted is added to its totals.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    /// Bind and listen on `addr`. Port 0 picks an ephemeral port.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if addr.port() != 0 {
            socket.set_reuse_address(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(std::net::TcpListener::from(socket));
        let addr = listener.local_addr()?;
        tracing::debug!(%addr, "listener bound");

        Ok(Self {
            inner: Arc::new(ListenerInner {
                addr,
                listener: Mutex::new(Some(listener)),
                closed: AtomicBool::new(false),
                binding: Mutex::new(None),
                accepted: AtomicU64::new(0),
                from_remote_bytes: AtomicU64::new(0),
                to_remote_bytes: AtomicU64::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Sockets accepted and handed out as connections so far.
    pub fn history_accepted_connection_count(&self) -> u64 {
        self.inner.accepted.load(Ordering::Relaxed)
    }

    pub fn from_remote_bytes(&self) -> u64 {
        self.inner.from_remote_bytes.load(Ordering::Relaxed)
    }

    pub fn to_remote_bytes(&self) -> u64 {
        self.inner.to_remote_bytes.load(Ordering::Relaxed)
    }

    pub fn event_loop(&self) -> Option<SelectorEventLoop> {
        lock(&self.inner.binding).as_ref().map(|b| b.event_loop.clone())
    }

    /// Stop listening. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let listener = lock(&self.inner.listener).take();
        let binding = lock(&self.inner.binding).clone();
        if let Some(Binding { event_loop, token: Some(token) }) = binding {
            event_loop.remove(token);
        }
        drop(listener);
        tracing::debug!(addr = %self.inner.addr, "listener closed");
    }

    /// Accept one pending socket, `None` when nothing is pending.
    pub(crate) fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        let guard = lock(&self.inner.listener);
        let Some(listener) = guard.as_ref() else {
            return Ok(None);
        };
        loop {
            match listener.accept() {
                Ok(accepted) => return Ok(Some(accepted)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn inc_accepted(&self) {
        self.inner.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recorder(&self) -> Arc<dyn NetFlowRecorder> {
        Arc::clone(&self.inner) as Arc<dyn NetFlowRecorder>
    }

    pub(crate) fn bind_loop(&self, event_loop: &SelectorEventLoop) -> Result<()> {
        let mut binding = lock(&self.inner.binding);
        if self.is_closed() {
            return Err(Error::Closed(format!("listener {}", self.inner.addr)));
        }
        if binding.is_some() {
            return Err(Error::AlreadyRegistered(format!("listener {}", self.inner.addr)));
        }
        *binding = Some(Binding { event_loop: event_loop.clone(), token: None });
        Ok(())
    }

    pub(crate) fn bound(&self, token: Token) {
        if let Some(binding) = lock(&self.inner.binding).as_mut() {
            binding.token = Some(token);
        }
        if self.is_closed() {
            if let Some(event_loop) = self.event_loop() {
                event_loop.remove(token);
            }
        }
    }

    pub(crate) fn unbind(&self) {
        lock(&self.inner.binding).take();
    }

    pub(crate) fn release_binding(&self, token: Token) {
        let mut binding = lock(&self.inner.binding);
        if binding.as_ref().is_some_and(|b| b.token == Some(token)) {
            *binding = None;
        }
    }

    /// The registration token while bound to a loop.
    pub(crate) fn token(&self) -> Option<Token> {
        lock(&self.inner.binding).as_ref().and_then(|b| b.token)
    }

    pub(crate) fn channel(&self) -> Arc<dyn Channel> {
        Arc::clone(&self.inner) as Arc<dyn Channel>
    }
}

impl NetFlowRecorder for ListenerInner {
    fn inc_from_remote_bytes(&self, bytes: u64) {
        self.from_remote_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn inc_to_remote_bytes(&self, bytes: u64) {
        self.to_remote_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl Channel for ListenerInner {
    fn register(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match lock(&self.listener).as_mut() {
            Some(listener) => registry.register(listener, token, interest),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener is closed")),
        }
    }

    fn reregister(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match lock(&self.listener).as_mut() {
            Some(listener) => registry.reregister(listener, token, interest),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener is closed")),
        }
    }

    fn deregister(&self, registry: &Registry) -> io::Result<()> {
        match lock(&self.listener).as_mut() {
            Some(listener) => registry.deregister(listener),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.inner.addr)
            .field("closed", &self.is_closed())
            .field("accepted", &self.history_accepted_connection_count())
            .finish()
    }
}
