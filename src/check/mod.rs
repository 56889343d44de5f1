//! Backend health checking
//!
//! A [`ConnectProbe`] tests a single connect against a deadline; a
//! [`HealthCheckClient`] repeats it on a schedule and reports up/down
//! transitions.

mod health;
mod probe;

pub use health::{HealthCheckClient, HealthCheckConfig, HealthCheckHandler};
pub use probe::ConnectProbe;
