use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::probe::ConnectProbe;
use crate::connection::NetEventLoop;
use crate::error::{Error, Result};
use crate::selector::TimerEvent;
use crate::util::lock;

/// How a target is probed and when its health flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// Connect timeout of a single probe.
    pub timeout: Duration,
    /// Pause between the end of one probe and the start of the next.
    pub period: Duration,
    /// Consecutive successes needed to report a down target as up.
    pub up: u32,
    /// Consecutive failures needed to report an up target as down.
    pub down: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            period: Duration::from_millis(5000),
            up: 2,
            down: 3,
        }
    }
}

/// Told about health transitions, never about individual probes.
pub trait HealthCheckHandler: Send + Sync {
    fn up(&self, remote: SocketAddr);
    fn down(&self, remote: SocketAddr, reason: &Error);
}

#[derive(Default)]
struct Streak {
    successes: u32,
    failures: u32,
}

struct HealthInner {
    event_loop: NetEventLoop,
    probe: ConnectProbe,
    config: HealthCheckConfig,
    handler: Arc<dyn HealthCheckHandler>,
    healthy: AtomicBool,
    streak: Mutex<Streak>,
    timer: Mutex<Option<TimerEvent>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Probes one target periodically on an event loop.
///
/// Targets start out healthy.
pub struct HealthCheckClient {
    inner: Arc<HealthInner>,
}

impl HealthCheckClient {
    pub fn new(
        event_loop: NetEventLoop,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        config: HealthCheckConfig,
        handler: Arc<dyn HealthCheckHandler>,
    ) -> Self {
        let probe = ConnectProbe::new(event_loop.clone(), remote, local, config.timeout);
        Self {
            inner: Arc::new(HealthInner {
                event_loop,
                probe,
                config,
                handler,
                healthy: AtomicBool::new(true),
                streak: Mutex::new(Streak::default()),
                timer: Mutex::new(None),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.inner.probe.remote()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }

    /// Begin probing. Calling it again has no effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(remote = %self.remote(), "health check started");
        schedule(&self.inner, Duration::ZERO);
    }

    /// Cancel the schedule. A probe already in flight finishes silently.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.probe.stop();
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.cancel();
        }
        tracing::debug!(remote = %self.remote(), "health check stopped");
    }
}

impl Drop for HealthCheckClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn schedule(inner: &Arc<HealthInner>, delay: Duration) {
    if inner.stopped.load(Ordering::Acquire) {
        return;
    }
    let weak = Arc::downgrade(inner);
    let timer = inner.event_loop.selector().delay(delay, move || run_probe(&weak));
    *lock(&inner.timer) = Some(timer);
}

fn run_probe(weak: &Weak<HealthInner>) {
    let Some(inner) = weak.upgrade() else { return };
    if inner.stopped.load(Ordering::Acquire) {
        return;
    }
    let weak = Weak::clone(weak);
    inner.probe.start(move |result| {
        if let Some(inner) = weak.upgrade() {
            record(&inner, result);
            schedule(&inner, inner.config.period);
        }
    });
}

fn record(inner: &HealthInner, result: Result<()>) {
    let remote = inner.probe.remote();
    let mut streak = lock(&inner.streak);
    match result {
        Ok(()) => {
            streak.successes = streak.successes.saturating_add(1);
            streak.failures = 0;
            if !inner.healthy.load(Ordering::Acquire) && streak.successes >= inner.config.up {
                inner.healthy.store(true, Ordering::Release);
                drop(streak);
                tracing::info!(%remote, "health check: target is up");
                inner.handler.up(remote);
            }
        }
        Err(e) => {
            streak.failures = streak.failures.saturating_add(1);
            streak.successes = 0;
            tracing::debug!(%remote, failures = streak.failures, error = %e, "health check failed");
            if inner.healthy.load(Ordering::Acquire) && streak.failures >= inner.config.down {
                inner.healthy.store(false, Ordering::Release);
                drop(streak);
                tracing::warn!(%remote, error = %e, "health check: target is down");
                inner.handler.down(remote, &e);
            }
        }
    }
}
