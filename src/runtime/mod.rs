//! Readiness-driven runtime.
//!
//! One event loop per worker thread, each with its own listener socket
//! bound with SO_REUSEPORT so the kernel balances incoming connections.
//! Connections are owned exclusively by the worker that accepted them.

pub mod event_loop;
pub mod transport;

pub use event_loop::{run, run_with_host};
