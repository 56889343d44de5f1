//! Backend servers
//!
//! This module tracks the backends a proxy relays to, their health and
//! accounting, and selects a backend for each accepted connection.

mod group;
mod handle;

pub use group::ServerGroup;
pub use handle::{BackendState, ServerHandle};
