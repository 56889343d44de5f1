//! tcplb - event-driven TCP load balancer
//!
//! Core library: a single-threaded reactor, socket wrappers driven by it,
//! the proxy session engine and backend health checking.

pub mod backend;
pub mod buffer;
pub mod check;
pub mod config;
pub mod connection;
pub mod error;
pub mod group;
pub mod proxy;
pub mod selector;

mod util;
