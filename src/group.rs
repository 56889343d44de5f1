//! Worker event loops
//!
//! An [`EventLoopGroup`] runs a fixed number of [`NetEventLoop`]s, each on
//! its own named thread, and hands them out round-robin.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::connection::NetEventLoop;
use crate::error::{Error, Result};
use crate::proxy::LoopChooser;
use crate::util::lock;

struct Worker {
    event_loop: NetEventLoop,
    thread: Option<JoinHandle<()>>,
}

struct GroupInner {
    name: String,
    workers: Mutex<Vec<Worker>>,
    loops: Vec<NetEventLoop>,
    current_index: AtomicUsize,
}

/// A set of event loops running on worker threads.
#[derive(Clone)]
pub struct EventLoopGroup {
    inner: Arc<GroupInner>,
}

impl EventLoopGroup {
    /// Start `size` loops named `{name}-{i}`.
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        if size == 0 {
            return Err(Error::Configuration(format!("event loop group {name} needs at least one loop")));
        }
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let loop_name = format!("{name}-{i}");
            let event_loop = match NetEventLoop::open(loop_name.clone()) {
                Ok(event_loop) => event_loop,
                Err(e) => {
                    tracing::error!(group = %name, error = %e, "opening event loop failed");
                    shutdown(&mut workers);
                    return Err(e);
                }
            };
            let runner = event_loop.clone();
            let spawned = std::thread::Builder::new().name(loop_name.clone()).spawn(move || {
                if let Err(e) = runner.selector().run() {
                    tracing::error!(event_loop = %runner.selector().name(), error = %e, "event loop failed");
                }
            });
            let thread = match spawned {
                Ok(thread) => thread,
                Err(e) => {
                    tracing::error!(group = %name, error = %e, "spawning event loop thread failed");
                    event_loop.selector().close();
                    shutdown(&mut workers);
                    return Err(e.into());
                }
            };
            tracing::debug!(event_loop = %loop_name, "event loop thread started");
            workers.push(Worker { event_loop, thread: Some(thread) });
        }

        let loops = workers.iter().map(|w| w.event_loop.clone()).collect();
        Ok(Self {
            inner: Arc::new(GroupInner {
                name,
                workers: Mutex::new(workers),
                loops,
                current_index: AtomicUsize::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.loops.len()
    }

    pub fn loops(&self) -> &[NetEventLoop] {
        &self.inner.loops
    }

    /// The next loop that is still open, round-robin.
    pub fn next(&self) -> Option<NetEventLoop> {
        let loops = &self.inner.loops;
        let start = self.inner.current_index.fetch_add(1, Ordering::Relaxed);
        (0..loops.len())
            .map(|offset| &loops[(start + offset) % loops.len()])
            .find(|event_loop| !event_loop.selector().is_closed())
            .cloned()
    }

    /// Close every loop and wait for the threads to exit.
    pub fn close(&self) {
        let mut workers = lock(&self.inner.workers);
        shutdown(&mut workers);
        tracing::debug!(group = %self.inner.name, "event loop group closed");
    }
}

fn shutdown(workers: &mut [Worker]) {
    for worker in workers.iter() {
        worker.event_loop.selector().close();
    }
    for worker in workers.iter_mut() {
        if let Some(thread) = worker.thread.take() {
            if thread.join().is_err() {
                tracing::error!(event_loop = %worker.event_loop.selector().name(), "event loop thread panicked");
            }
        }
    }
}

impl LoopChooser for EventLoopGroup {
    fn next_loop(&self) -> Option<NetEventLoop> {
        self.next()
    }
}

impl std::fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("name", &self.inner.name)
            .field("size", &self.inner.loops.len())
            .finish()
    }
}
