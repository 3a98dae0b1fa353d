//! hsxd: the HSX executive daemon library
//!
//! TCP line-delimited JSON control plane over the `hsx-runtime` executive:
//! sessions with PID locks, an ACK-driven event stream, and an auto-clock
//! driver.

pub mod api;
pub mod broadcast;
pub mod clock;
pub mod proto;
pub mod server;
pub mod session;
pub mod state;
pub mod tracing_layer;

pub use state::Daemon;
