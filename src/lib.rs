//! emberweb: an embeddable HTTP/1.1 server engine.
//!
//! The engine is a staged pipeline driven by a readiness-based event
//! loop. Each request gets a small network of byte queues connecting a
//! handler, any applicable filters, and a connector that owns the
//! socket; back-pressure propagates upstream through queue watermarks
//! so no stage buffers unboundedly.
//!
//! Embedders register their own [`pipeline::Stage`] implementations on
//! a [`host::Host`] and hand it to [`runtime::run_with_host`]; the
//! built-in stages serve static files out of the box.

pub mod config;
pub mod conn;
pub mod error;
pub mod host;
pub mod http;
pub mod pipeline;
pub mod runtime;
pub mod stages;

pub use config::Config;
pub use conn::{Conn, Disposition};
pub use error::{EngineError, Result};
pub use host::Host;
pub use pipeline::{Cx, Packet, Stage, StageKind, Tx};
