use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::buffer::{Buffer, BufferWatcher, Stored};
use crate::error::{Error, Result};
use crate::selector::{Channel, Ops, SelectorEventLoop};
use crate::util::lock;

/// Receives the byte counts of every connection it is attached to.
///
/// Implementations are called from event loop threads and read from
/// reporting threads, so they keep their totals in atomics.
pub trait NetFlowRecorder: Send + Sync {
    fn inc_from_remote_bytes(&self, bytes: u64);
    fn inc_to_remote_bytes(&self, bytes: u64);
}

/// Notified once when a connection closes.
pub trait ConnCloseHandler: Send + Sync {
    fn on_connection_close(&self, connection: &Connection);
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Back-reference from a socket wrapper to the loop it is registered on.
#[derive(Clone)]
pub(crate) struct Binding {
    pub(crate) event_loop: SelectorEventLoop,
    // unset while the registration is in flight
    pub(crate) token: Option<Token>,
}

pub(crate) struct ConnectionInner {
    seq: u64,
    remote: SocketAddr,
    local: SocketAddr,
    in_buffer: Buffer,
    out_buffer: Buffer,
    stream: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
    remote_closed: AtomicBool,
    connecting: AtomicBool,
    binding: Mutex<Option<Binding>>,
    from_remote_bytes: AtomicU64,
    to_remote_bytes: AtomicU64,
    recorders: Mutex<Vec<Arc<dyn NetFlowRecorder>>>,
    close_handlers: Mutex<Vec<Arc<dyn ConnCloseHandler>>>,
}

impl ConnectionInner {
    fn add_ops(&self, ops: Ops) {
        let binding = lock(&self.binding).clone();
        if let Some(Binding { event_loop, token: Some(token) }) = binding {
            event_loop.add_ops(token, ops);
        }
    }
}

// Bytes landed in the output buffer: start watching for writability.
struct OutBufferWatcher(Weak<ConnectionInner>);

impl BufferWatcher for OutBufferWatcher {
    fn readable_et(&self) {
        if let Some(inner) = self.0.upgrade() {
            if !inner.closed.load(Ordering::Acquire) && !inner.connecting.load(Ordering::Acquire) {
                inner.add_ops(Ops::WRITE);
            }
        }
    }
}

// Space was freed in the input buffer: start reading again.
struct InBufferWatcher(Weak<ConnectionInner>);

impl BufferWatcher for InBufferWatcher {
    fn writable_et(&self) {
        if let Some(inner) = self.0.upgrade() {
            if !inner.closed.load(Ordering::Acquire)
                && !inner.remote_closed.load(Ordering::Acquire)
                && !inner.connecting.load(Ordering::Acquire)
            {
                inner.add_ops(Ops::READ);
            }
        }
    }
}

/// A TCP connection with an input and an output buffer.
///
/// The handle is cheap to clone; all clones refer to the same socket. A
/// connection is registered to at most one event loop at a time.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap an accepted stream.
    pub fn new(stream: TcpStream, in_buffer: Buffer, out_buffer: Buffer) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        Ok(Self::from_parts(stream, remote, local, in_buffer, out_buffer, false))
    }

    pub(crate) fn from_parts(
        stream: TcpStream,
        remote: SocketAddr,
        local: SocketAddr,
        in_buffer: Buffer,
        out_buffer: Buffer,
        connecting: bool,
    ) -> Self {
        let inner = Arc::new(ConnectionInner {
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            remote,
            local,
            in_buffer: in_buffer.clone(),
            out_buffer: out_buffer.clone(),
            stream: Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
            connecting: AtomicBool::new(connecting),
            binding: Mutex::new(None),
            from_remote_bytes: AtomicU64::new(0),
            to_remote_bytes: AtomicU64::new(0),
            recorders: Mutex::new(Vec::new()),
            close_handlers: Mutex::new(Vec::new()),
        });
        in_buffer.add_watcher(Arc::new(InBufferWatcher(Arc::downgrade(&inner))));
        out_buffer.add_watcher(Arc::new(OutBufferWatcher(Arc::downgrade(&inner))));
        Self { inner }
    }

    /// Identity of the connection: `remote/local`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.inner.remote, self.inner.local)
    }

    /// Process-wide creation sequence number.
    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    pub fn remote(&self) -> SocketAddr {
        self.inner.remote
    }

    pub fn local(&self) -> SocketAddr {
        self.inner.local
    }

    pub fn in_buffer(&self) -> &Buffer {
        &self.inner.in_buffer
    }

    pub fn out_buffer(&self) -> &Buffer {
        &self.inner.out_buffer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The peer has finished sending.
    pub fn is_remote_closed(&self) -> bool {
        self.inner.remote_closed.load(Ordering::Acquire)
    }

    pub fn from_remote_bytes(&self) -> u64 {
        self.inner.from_remote_bytes.load(Ordering::Relaxed)
    }

    pub fn to_remote_bytes(&self) -> u64 {
        self.inner.to_remote_bytes.load(Ordering::Relaxed)
    }

    pub fn add_net_flow_recorder(&self, recorder: Arc<dyn NetFlowRecorder>) {
        lock(&self.inner.recorders).push(recorder);
    }

    pub fn add_conn_close_handler(&self, handler: Arc<dyn ConnCloseHandler>) {
        lock(&self.inner.close_handlers).push(handler);
    }

    /// The loop this connection is currently registered on.
    pub fn event_loop(&self) -> Option<SelectorEventLoop> {
        lock(&self.inner.binding).as_ref().map(|b| b.event_loop.clone())
    }

    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Close the socket and leave the event loop. Buffers are kept; the
    /// owner releases them. Close handlers fire exactly once.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let stream = lock(&self.inner.stream).take();
        let binding = lock(&self.inner.binding).clone();
        if let Some(Binding { event_loop, token: Some(token) }) = binding {
            event_loop.remove(token);
        }
        drop(stream);
        tracing::trace!(conn = %self, "connection closed");

        let handlers = std::mem::take(&mut *lock(&self.inner.close_handlers));
        for handler in handlers {
            handler.on_connection_close(self);
        }
    }

    pub(crate) fn mark_remote_closed(&self) {
        self.inner.remote_closed.store(true, Ordering::Release);
    }

    pub(crate) fn set_connecting(&self, connecting: bool) {
        self.inner.connecting.store(connecting, Ordering::Release);
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::Acquire)
    }

    pub(crate) fn with_stream<T>(&self, f: impl FnOnce(&mut TcpStream) -> io::Result<T>) -> io::Result<T> {
        let mut stream = lock(&self.inner.stream);
        match stream.as_mut() {
            Some(stream) => f(stream),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closed")),
        }
    }

    pub(crate) fn store_from_remote(&self) -> io::Result<Stored> {
        let in_buffer = &self.inner.in_buffer;
        self.with_stream(|stream| in_buffer.store_from(stream))
    }

    pub(crate) fn write_to_remote(&self) -> io::Result<usize> {
        let out_buffer = &self.inner.out_buffer;
        self.with_stream(|stream| out_buffer.write_to(stream))
    }

    pub(crate) fn record_from_remote(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.inner.from_remote_bytes.fetch_add(bytes, Ordering::Relaxed);
        for recorder in lock(&self.inner.recorders).iter() {
            recorder.inc_from_remote_bytes(bytes);
        }
    }

    pub(crate) fn record_to_remote(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.inner.to_remote_bytes.fetch_add(bytes, Ordering::Relaxed);
        for recorder in lock(&self.inner.recorders).iter() {
            recorder.inc_to_remote_bytes(bytes);
        }
    }

    /// Claim the connection for `event_loop`. The token is filled in by
    /// [`bound`](Self::bound) once the registration succeeded.
    pub(crate) fn bind(&self, event_loop: &SelectorEventLoop) -> Result<()> {
        let mut binding = lock(&self.inner.binding);
        if self.is_closed() {
            return Err(Error::Closed(format!("connection {self}")));
        }
        if binding.is_some() {
            return Err(Error::AlreadyRegistered(format!("connection {self}")));
        }
        *binding = Some(Binding { event_loop: event_loop.clone(), token: None });
        Ok(())
    }

    pub(crate) fn bound(&self, token: Token) {
        if let Some(binding) = lock(&self.inner.binding).as_mut() {
            binding.token = Some(token);
        }
        // a close that raced with the registration could not remove it
        if self.is_closed() {
            if let Some(event_loop) = self.event_loop() {
                event_loop.remove(token);
            }
        }
    }

    pub(crate) fn unbind(&self) {
        lock(&self.inner.binding).take();
    }

    /// Drop the back-reference if it still points at `token`. Returns whether
    /// it did.
    pub(crate) fn release_binding(&self, token: Token) -> bool {
        let mut binding = lock(&self.inner.binding);
        if binding.as_ref().is_some_and(|b| b.token == Some(token)) {
            *binding = None;
            return true;
        }
        false
    }

    pub(crate) fn binding_token(&self) -> Option<Token> {
        lock(&self.inner.binding).as_ref().and_then(|b| b.token)
    }

    pub(crate) fn channel(&self) -> Arc<dyn Channel> {
        Arc::clone(&self.inner) as Arc<dyn Channel>
    }
}

impl Channel for ConnectionInner {
    fn register(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match lock(&self.stream).as_mut() {
            Some(stream) => registry.register(stream, token, interest),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closed")),
        }
    }

    fn reregister(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match lock(&self.stream).as_mut() {
            Some(stream) => registry.reregister(stream, token, interest),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closed")),
        }
    }

    fn deregister(&self, registry: &Registry) -> io::Result<()> {
        match lock(&self.stream).as_mut() {
            Some(stream) => registry.deregister(stream),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.inner.remote, self.inner.local)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("seq", &self.inner.seq)
            .field("remote", &self.inner.remote)
            .field("local", &self.inner.local)
            .field("closed", &self.is_closed())
            .field("remote_closed", &self.is_remote_closed())
            .finish()
    }
}
