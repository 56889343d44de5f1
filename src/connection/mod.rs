//! Socket wrappers and the net dispatcher.
//!
//! [`Listener`], [`Connection`] and [`ClientConnection`] own a socket;
//! connections also own an input and an output [`Buffer`](crate::buffer::Buffer).
//! [`NetEventLoop`] registers them on a reactor and turns readiness into
//! buffer fills, drains and interest toggles: a full input buffer stops
//! reading, an empty output buffer stops writing, and a buffer edge in the
//! other direction re-adds the interest.

mod client;
#[allow(clippy::module_inception)]
mod connection;
mod connector;
mod handler;
mod listener;
mod net_loop;

pub use client::ClientConnection;
pub use connection::{ConnCloseHandler, Connection, NetFlowRecorder};
pub use connector::{Connector, ConnectorHooks};
pub use handler::{
    ClientConnectionHandler, ClientConnectionHandlerContext, ConnectionHandler,
    ConnectionHandlerContext, ServerHandler, ServerHandlerContext,
};
pub use listener::Listener;
pub use net_loop::NetEventLoop;
