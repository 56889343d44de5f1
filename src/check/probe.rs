use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::buffer::Buffer;
use crate::connection::{
    ClientConnectionHandler, ClientConnectionHandlerContext, ConnectionHandler,
    ConnectionHandlerContext, Connector, NetEventLoop,
};
use crate::error::{Error, Result};
use crate::selector::TimerEvent;
use crate::util::lock;

type ProbeCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// One probe run. Whoever completes it first wins; later outcomes are
/// dropped.
struct Attempt {
    called: AtomicBool,
    stopped: Arc<AtomicBool>,
    callback: Mutex<Option<ProbeCallback>>,
    timer: Mutex<Option<TimerEvent>>,
}

impl Attempt {
    fn complete(&self, result: Result<()>) -> bool {
        if self.called.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(timer) = lock(&self.timer).take() {
            timer.cancel();
        }
        let callback = lock(&self.callback).take();
        if self.stopped.load(Ordering::Acquire) {
            return true;
        }
        if let Some(callback) = callback {
            callback(result);
        }
        true
    }
}

/// Connect-only health probe.
///
/// Opens a connection with zero-length buffers and closes it as soon as the
/// connect completes. The callback passed to [`start`](Self::start) fires
/// exactly once with one of: `Ok(())`, the connect error, or
/// [`Error::Timeout`].
pub struct ConnectProbe {
    event_loop: NetEventLoop,
    remote: SocketAddr,
    local: Option<SocketAddr>,
    timeout: Duration,
    stopped: Arc<AtomicBool>,
}

impl ConnectProbe {
    pub fn new(event_loop: NetEventLoop, remote: SocketAddr, local: Option<SocketAddr>, timeout: Duration) -> Self {
        Self {
            event_loop,
            remote,
            local,
            timeout,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Run the probe. `callback` runs on the loop thread, or on the calling
    /// thread when the probe fails before reaching the loop.
    pub fn start(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let attempt = Arc::new(Attempt {
            called: AtomicBool::new(false),
            stopped: Arc::clone(&self.stopped),
            callback: Mutex::new(Some(Box::new(callback))),
            timer: Mutex::new(None),
        });

        let connector = match self.local {
            Some(local) => Connector::new(self.remote, local),
            None => Connector::to(self.remote),
        };
        let connection = match connector.connect(Buffer::allocate(0), Buffer::allocate(0)) {
            Ok(connection) => connection,
            Err(e) => {
                if e.raw_os_error() == Some(libc::EMFILE) || e.raw_os_error() == Some(libc::ENFILE) {
                    tracing::error!(remote = %self.remote, error = %e, "creating probe socket failed");
                }
                attempt.complete(Err(e.into()));
                return;
            }
        };

        let timeout = self.timeout;
        let timer = {
            let attempt = Arc::clone(&attempt);
            let connection = connection.clone();
            self.event_loop.selector().delay(timeout, move || {
                tracing::debug!(conn = %connection, "health check timed out");
                attempt.complete(Err(Error::Timeout(timeout)));
                connection.close();
            })
        };
        *lock(&attempt.timer) = Some(timer);

        let handler = ProbeHandler { attempt: Arc::clone(&attempt) };
        if let Err(e) = self.event_loop.add_client_connection(&connection, Box::new(handler)) {
            tracing::error!(conn = %connection, error = %e, "registering probe connection failed");
            connection.close();
            attempt.complete(Err(e));
        }
    }

    /// Suppress every further callback of this probe. Sockets still get
    /// closed.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

struct ProbeHandler {
    attempt: Arc<Attempt>,
}

impl ConnectionHandler for ProbeHandler {
    fn exception(&mut self, ctx: &ConnectionHandlerContext<'_>, err: io::Error) {
        tracing::debug!(conn = %ctx.connection, error = %err, "health check connect failed");
        self.attempt.complete(Err(err.into()));
        ctx.connection.close();
    }

    fn closed(&mut self, ctx: &ConnectionHandlerContext<'_>) {
        tracing::warn!(conn = %ctx.connection, "probe connection should not read or write");
    }

    fn removed(&mut self, ctx: &ConnectionHandlerContext<'_>) {
        if !ctx.connection.is_closed() {
            self.attempt.complete(Err(Error::Closed(format!("probe connection {}", ctx.connection))));
            ctx.connection.close();
        }
    }
}

impl ClientConnectionHandler for ProbeHandler {
    fn connected(&mut self, ctx: &ClientConnectionHandlerContext<'_>) {
        self.attempt.complete(Ok(()));
        ctx.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn attempt(calls: Arc<AtomicUsize>, stopped: bool) -> Attempt {
        Attempt {
            called: AtomicBool::new(false),
            stopped: Arc::new(AtomicBool::new(stopped)),
            callback: Mutex::new(Some(Box::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }))),
            timer: Mutex::new(None),
        }
    }

    #[test]
    fn test_success_then_timeout_calls_back_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let attempt = attempt(Arc::clone(&calls), false);
        assert!(attempt.complete(Ok(())));
        assert!(!attempt.complete(Err(Error::Timeout(Duration::from_millis(50)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_then_success_calls_back_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let attempt = attempt(Arc::clone(&calls), false);
        assert!(attempt.complete(Err(Error::Timeout(Duration::from_millis(50)))));
        assert!(!attempt.complete(Ok(())));
        assert!(!attempt.complete(Err(io::Error::from(io::ErrorKind::ConnectionRefused).into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stopped_attempt_never_calls_back() {
        let calls = Arc::new(AtomicUsize::new(0));
        let attempt = attempt(Arc::clone(&calls), true);
        assert!(attempt.complete(Ok(())));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
