//! One proxied stream: an accepted connection paired with the outbound
//! connection opened for it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::connection::{ClientConnection, ConnCloseHandler, Connection};
use crate::util::lock;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a [`Session`].
///
/// `Open` moves to one of the half-closed states when one side finished,
/// and every state ends in `Closed`. Nothing leaves a half-closed state
/// except towards `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Both connections are live.
    Open,
    /// The active (accepted) connection is closed; the passive one is
    /// still flushing.
    HalfClosedActive,
    /// The passive (outbound) connection is closed; the active one is
    /// still flushing.
    HalfClosedPassive,
    /// Both connections are closed and the buffers are released.
    Closed,
}

type ClosedHook = Box<dyn FnOnce(&Session) + Send>;

struct SessionInner {
    id: u64,
    active: Connection,
    passive: ClientConnection,
    state: Mutex<SessionState>,
    released: AtomicBool,
    on_closed: Mutex<Vec<ClosedHook>>,
}

/// The active connection and its passive counterpart.
///
/// The two connections share their buffers with the roles swapped: the
/// active side's input buffer is the passive side's output buffer and the
/// other way round.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionCloseWatcher(Weak<SessionInner>);

impl ConnCloseHandler for SessionCloseWatcher {
    fn on_connection_close(&self, _connection: &Connection) {
        if let Some(inner) = self.0.upgrade() {
            Session { inner }.refresh();
        }
    }
}

impl Session {
    pub fn new(active: Connection, passive: ClientConnection) -> Self {
        let inner = Arc::new(SessionInner {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            active,
            passive,
            state: Mutex::new(SessionState::Open),
            released: AtomicBool::new(false),
            on_closed: Mutex::new(Vec::new()),
        });
        let watcher = Arc::new(SessionCloseWatcher(Arc::downgrade(&inner)));
        inner.active.add_conn_close_handler(watcher.clone());
        inner.passive.add_conn_close_handler(watcher);
        let session = Self { inner };
        // either side may have been closed before the watcher was installed
        session.refresh();
        session
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The accepted connection.
    pub fn active(&self) -> &Connection {
        &self.inner.active
    }

    /// The outbound connection.
    pub fn passive(&self) -> &ClientConnection {
        &self.inner.passive
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Run `hook` once the session reaches [`SessionState::Closed`], right
    /// away if it already has.
    pub fn on_closed(&self, hook: impl FnOnce(&Session) + Send + 'static) {
        {
            let mut hooks = lock(&self.inner.on_closed);
            if !self.is_closed() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook(self);
    }

    /// Close both connections without waiting for buffered bytes.
    /// Idempotent.
    pub fn close(&self) {
        self.inner.active.close();
        self.inner.passive.close();
        self.refresh();
    }

    fn refresh(&self) {
        let next = match (self.inner.active.is_closed(), self.inner.passive.is_closed()) {
            (false, false) => SessionState::Open,
            (true, false) => SessionState::HalfClosedActive,
            (false, true) => SessionState::HalfClosedPassive,
            (true, true) => SessionState::Closed,
        };
        let hooks = {
            let mut hooks = lock(&self.inner.on_closed);
            let mut state = lock(&self.inner.state);
            if *state == SessionState::Closed || *state == next {
                return;
            }
            tracing::trace!(session = self.inner.id, from = ?*state, to = ?next, "session state");
            *state = next;
            if next != SessionState::Closed {
                return;
            }
            std::mem::take(&mut *hooks)
        };
        self.release_buffers();
        tracing::debug!(session = %self, "session closed");
        for hook in hooks {
            hook(self);
        }
    }

    fn release_buffers(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        // the passive side holds the same two buffers
        self.inner.active.in_buffer().clean();
        self.inner.active.out_buffer().clean();
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session({}: {} -> {})", self.inner.id, self.inner.active, self.inner.passive)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("active", &self.inner.active)
            .field("passive", self.inner.passive.connection())
            .field("state", &self.state())
            .finish()
    }
}
