//! The reactor.
//!
//! A [`SelectorEventLoop`] owns a poller, a registration table keyed by
//! [`mio::Token`] and a timer queue. Each registration pairs a [`Channel`]
//! (the descriptor) with a [`Handler`] (its callbacks) and an [`Ops`]
//! interest set. One thread runs the loop; every other thread talks to it
//! through the same cloneable handle.

mod event_loop;
mod ops;
mod timer;

pub use event_loop::{Channel, Handler, HandlerContext, SelectorEventLoop};
pub use ops::Ops;
pub use timer::TimerEvent;
