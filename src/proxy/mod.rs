//! Reverse proxy functionality
//!
//! This module implements the session engine: accepted connections are
//! paired with outbound connections to a chosen backend and relayed until
//! both sides are done.

mod config;
mod relay;
mod session;

pub use config::{BackendChooser, LoopChooser, ProxyNetConfig};
pub use relay::{Proxy, ProxyEventHandler};
pub use session::{Session, SessionState};
