//! Error types shared by the relay engine.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the reactor, the socket wrappers and the proxy.
///
/// Per-connection failures never escape the owning event loop; they are
/// reported once through the relevant handler callback and the affected
/// connection (or session) is torn down.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid proxy/configuration options. Never retried.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A connection or listener was registered twice.
    #[error("{0} already registered to an event loop")]
    AlreadyRegistered(String),

    /// The target connection or listener has already been closed.
    #[error("{0} is closed")]
    Closed(String),

    /// A health-check probe did not complete before its deadline.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// `run` was called on a loop that another thread is running.
    #[error("{0} is already running")]
    AlreadyRunning(String),

    /// The event loop has been closed and accepts no more work.
    #[error("event loop is closed")]
    LoopClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this is a probe timeout rather than a connect failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
