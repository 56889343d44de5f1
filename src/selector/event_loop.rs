use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use super::ops::Ops;
use super::timer::{TimerEvent, TimerQueue};
use crate::error::{Error, Result};
use crate::util::lock;

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

/// A descriptor the reactor can watch.
///
/// Implementors own their socket; the reactor only asks them to (re)arm or
/// disarm it. A channel whose socket has already been closed should treat
/// `deregister` as a no-op.
pub trait Channel: Send + Sync {
    fn register(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()>;
    fn reregister(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()>;
    fn deregister(&self, registry: &Registry) -> io::Result<()>;
}

/// Callbacks for one registration.
///
/// All callbacks run on the loop's own thread, one at a time.
pub trait Handler: Send {
    fn accept(&mut self, ctx: &HandlerContext<'_>) {
        tracing::warn!(token = ctx.token().0, "accept should not fire on this registration");
    }

    fn connected(&mut self, ctx: &HandlerContext<'_>) {
        tracing::warn!(token = ctx.token().0, "connected should not fire on this registration");
    }

    fn readable(&mut self, ctx: &HandlerContext<'_>) {
        tracing::warn!(token = ctx.token().0, "readable should not fire on this registration");
    }

    fn writable(&mut self, ctx: &HandlerContext<'_>) {
        tracing::warn!(token = ctx.token().0, "writable should not fire on this registration");
    }

    /// The registration left the loop, voluntarily or because the loop closed.
    fn removed(&mut self, ctx: &HandlerContext<'_>);
}

/// What a handler callback can do to its own registration.
pub struct HandlerContext<'a> {
    event_loop: &'a SelectorEventLoop,
    token: Token,
}

impl<'a> HandlerContext<'a> {
    pub fn event_loop(&self) -> &'a SelectorEventLoop {
        self.event_loop
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn ops(&self) -> Ops {
        self.event_loop.ops(self.token).unwrap_or(Ops::NONE)
    }

    pub fn modify(&self, ops: Ops) {
        self.event_loop.modify(self.token, ops);
    }

    pub fn add_ops(&self, ops: Ops) {
        self.event_loop.add_ops(self.token, ops);
    }

    pub fn rm_ops(&self, ops: Ops) {
        self.event_loop.rm_ops(self.token, ops);
    }

    pub fn remove(&self) {
        self.event_loop.remove(self.token);
    }
}

struct Registration {
    channel: Arc<dyn Channel>,
    ops: Ops,
    // armed in the poller with the interest derived from `ops`
    armed: bool,
    // initial poller registration still in flight on the adding thread
    registering: bool,
    dirty: bool,
    removed: bool,
    // taken out while one of its callbacks is running
    handler: Option<Box<dyn Handler>>,
}

#[derive(Default)]
struct State {
    registrations: HashMap<Token, Registration>,
    dirty: Vec<Token>,
    removing: Vec<Token>,
    timers: TimerQueue,
}

struct Inner {
    name: String,
    registry: Registry,
    waker: Waker,
    poll: Mutex<Option<Poll>>,
    state: Mutex<State>,
    next_token: AtomicUsize,
    closed: AtomicBool,
    running: AtomicBool,
    thread: Mutex<Option<ThreadId>>,
}

#[derive(Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed() || event.is_error(),
        }
    }
}

/// Single-threaded readiness-driven dispatch loop with a timer queue.
///
/// The handle is cheap to clone and may be shared across threads.
/// Registration, interest changes, removal and timer scheduling are safe to
/// call from any thread; their effects are observed by the loop thread on its
/// next cycle. Interest changes are applied right before each poll, and every
/// change re-arms the descriptor, so an edge that was already pending is
/// reported again.
#[derive(Clone)]
pub struct SelectorEventLoop {
    inner: Arc<Inner>,
}

impl SelectorEventLoop {
    pub fn open(name: impl Into<String>) -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                registry,
                waker,
                poll: Mutex::new(Some(poll)),
                state: Mutex::new(State::default()),
                next_token: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                running: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of live registrations.
    pub fn registration_count(&self) -> usize {
        lock(&self.inner.state)
            .registrations
            .values()
            .filter(|reg| !reg.removed)
            .count()
    }

    pub fn ptr_eq(&self, other: &SelectorEventLoop) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the caller is running on this loop's thread.
    pub fn in_loop_thread(&self) -> bool {
        *lock(&self.inner.thread) == Some(thread::current().id())
    }

    /// Register `channel` with interest `ops`; `handler` receives its events.
    pub fn add(
        &self,
        channel: Arc<dyn Channel>,
        ops: Ops,
        handler: Box<dyn Handler>,
    ) -> Result<Token> {
        if self.is_closed() {
            return Err(Error::LoopClosed);
        }
        let token = Token(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        let interest = ops.interest();
        lock(&self.inner.state).registrations.insert(
            token,
            Registration {
                channel: Arc::clone(&channel),
                ops,
                armed: false,
                registering: interest.is_some(),
                dirty: false,
                removed: false,
                handler: Some(handler),
            },
        );

        if let Some(interest) = interest {
            if let Err(e) = channel.register(&self.inner.registry, token, interest) {
                lock(&self.inner.state).registrations.remove(&token);
                return Err(e.into());
            }
            let mut state = lock(&self.inner.state);
            if let Some(reg) = state.registrations.get_mut(&token) {
                reg.armed = true;
                reg.registering = false;
            }
        }
        tracing::trace!(event_loop = %self.inner.name, token = token.0, ?ops, "registered");
        self.wakeup();
        Ok(token)
    }

    pub fn ops(&self, token: Token) -> Option<Ops> {
        lock(&self.inner.state)
            .registrations
            .get(&token)
            .filter(|reg| !reg.removed)
            .map(|reg| reg.ops)
    }

    pub fn modify(&self, token: Token, ops: Ops) {
        self.update_ops(token, |_| ops);
    }

    pub fn add_ops(&self, token: Token, ops: Ops) {
        self.update_ops(token, |current| current | ops);
    }

    pub fn rm_ops(&self, token: Token, ops: Ops) {
        self.update_ops(token, |current| current.without(ops));
    }

    /// Take the registration out of the loop. Its handler's `removed`
    /// callback fires on the loop thread.
    pub fn remove(&self, token: Token) {
        {
            let mut state = lock(&self.inner.state);
            let State { registrations, removing, .. } = &mut *state;
            match registrations.get_mut(&token) {
                Some(reg) if !reg.removed => {
                    reg.removed = true;
                    removing.push(token);
                }
                _ => return,
            }
        }
        self.wakeup();
    }

    /// Run `callback` on the loop thread after `delay`.
    pub fn delay(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerEvent {
        let timer = lock(&self.inner.state).timers.push(delay, Box::new(callback));
        self.wakeup();
        timer
    }

    /// Poll and dispatch on the calling thread until [`close`](Self::close).
    pub fn run(&self) -> Result<()> {
        let Some(mut poll) = lock(&self.inner.poll).take() else {
            // closed before it ever ran
            if self.is_closed() {
                return Ok(());
            }
            return Err(Error::AlreadyRunning(format!("event loop {}", self.inner.name)));
        };
        *lock(&self.inner.thread) = Some(thread::current().id());
        self.inner.running.store(true, Ordering::Release);
        tracing::debug!(event_loop = %self.inner.name, "event loop started");

        let result = self.poll_until_closed(&mut poll);

        self.teardown();
        self.inner.running.store(false, Ordering::Release);
        *lock(&self.inner.thread) = None;
        tracing::debug!(event_loop = %self.inner.name, "event loop stopped");
        result
    }

    /// Stop the loop. Every remaining registration receives `removed`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // never started: nobody else will release the registrations
        if lock(&self.inner.poll).take().is_some() {
            self.teardown();
            return;
        }
        self.wakeup();
    }

    fn poll_until_closed(&self, poll: &mut Poll) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.is_closed() {
            self.apply_changes();
            let timeout = self.next_timeout();
            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(event_loop = %self.inner.name, error = %e, "poll failed");
                return Err(e.into());
            }
            self.fire_timers();
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(event.token(), Readiness::from(event));
                self.finalize_removals();
            }
            self.finalize_removals();
        }
        Ok(())
    }

    fn dispatch(&self, token: Token, readiness: Readiness) {
        let (mut handler, ops) = {
            let mut state = lock(&self.inner.state);
            match state.registrations.get_mut(&token) {
                Some(reg) if !reg.removed => match reg.handler.take() {
                    Some(handler) => (handler, reg.ops),
                    None => return,
                },
                _ => return,
            }
        };

        let ctx = HandlerContext { event_loop: self, token };
        if ops.contains(Ops::ACCEPT) && readiness.readable {
            handler.accept(&ctx);
        } else if ops.contains(Ops::CONNECT) && readiness.writable {
            handler.connected(&ctx);
        } else {
            if ops.contains(Ops::READ) && readiness.readable {
                handler.readable(&ctx);
            }
            // the read callback may have changed interest or removed us
            if readiness.writable && self.ops(token).is_some_and(|ops| ops.contains(Ops::WRITE)) {
                handler.writable(&ctx);
            }
        }

        if let Some(reg) = lock(&self.inner.state).registrations.get_mut(&token) {
            reg.handler = Some(handler);
        }
    }

    fn update_ops(&self, token: Token, f: impl FnOnce(Ops) -> Ops) {
        {
            let mut state = lock(&self.inner.state);
            let State { registrations, dirty, .. } = &mut *state;
            let Some(reg) = registrations.get_mut(&token) else { return };
            if reg.removed {
                return;
            }
            reg.ops = f(reg.ops);
            if !reg.dirty {
                reg.dirty = true;
                dirty.push(token);
            }
        }
        self.wakeup();
    }

    fn apply_changes(&self) {
        self.finalize_removals();

        let changes: Vec<(Token, Arc<dyn Channel>, Ops, bool)> = {
            let mut state = lock(&self.inner.state);
            let State { registrations, dirty, .. } = &mut *state;
            let mut changes = Vec::with_capacity(dirty.len());
            let mut deferred = Vec::new();
            for token in dirty.drain(..) {
                let Some(reg) = registrations.get_mut(&token) else { continue };
                if reg.removed {
                    continue;
                }
                if reg.registering {
                    deferred.push(token);
                    continue;
                }
                reg.dirty = false;
                changes.push((token, Arc::clone(&reg.channel), reg.ops, reg.armed));
            }
            dirty.extend(deferred);
            changes
        };

        for (token, channel, ops, armed) in changes {
            let registry = &self.inner.registry;
            let result = match (ops.interest(), armed) {
                (Some(interest), true) => channel.reregister(registry, token, interest).map(|_| true),
                (Some(interest), false) => channel.register(registry, token, interest).map(|_| true),
                (None, true) => channel.deregister(registry).map(|_| false),
                (None, false) => Ok(false),
            };
            match result {
                Ok(now_armed) => {
                    if let Some(reg) = lock(&self.inner.state).registrations.get_mut(&token) {
                        reg.armed = now_armed;
                    }
                }
                Err(e) => {
                    tracing::debug!(event_loop = %self.inner.name, token = token.0, ?ops, error = %e, "updating interest failed");
                }
            }
        }
    }

    fn finalize_removals(&self) {
        loop {
            let tokens = std::mem::take(&mut lock(&self.inner.state).removing);
            if tokens.is_empty() {
                return;
            }
            let mut deferred = Vec::new();
            for token in tokens {
                let reg = {
                    let mut state = lock(&self.inner.state);
                    match state.registrations.get(&token) {
                        Some(reg) if reg.registering || reg.handler.is_none() => {
                            deferred.push(token);
                            continue;
                        }
                        Some(_) => state.registrations.remove(&token),
                        None => None,
                    }
                };
                let Some(mut reg) = reg else { continue };
                if reg.armed {
                    let _ = reg.channel.deregister(&self.inner.registry);
                }
                tracing::trace!(event_loop = %self.inner.name, token = token.0, "removed");
                if let Some(mut handler) = reg.handler.take() {
                    handler.removed(&HandlerContext { event_loop: self, token });
                }
            }
            if !deferred.is_empty() {
                lock(&self.inner.state).removing.extend(deferred);
                return;
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        let mut state = lock(&self.inner.state);
        if !state.removing.is_empty() {
            return Some(Duration::ZERO);
        }
        state
            .timers
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        loop {
            let due = lock(&self.inner.state).timers.pop_due(now);
            match due {
                Some(callback) => callback(),
                None => return,
            }
        }
    }

    fn teardown(&self) {
        {
            let mut state = lock(&self.inner.state);
            let State { registrations, removing, timers, .. } = &mut *state;
            for (token, reg) in registrations.iter_mut() {
                if !reg.removed {
                    reg.removed = true;
                    removing.push(*token);
                }
            }
            timers.clear();
        }
        self.finalize_removals();
    }

    fn wakeup(&self) {
        if !self.in_loop_thread() {
            if let Err(e) = self.inner.waker.wake() {
                tracing::warn!(event_loop = %self.inner.name, error = %e, "failed to wake event loop");
            }
        }
    }
}

impl std::fmt::Debug for SelectorEventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorEventLoop")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .field("running", &self.is_running())
            .finish()
    }
}
