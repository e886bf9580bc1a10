//! Host: the constructed-once service record shared by all workers.
//!
//! Holds the registered stage templates, the filter order, size limits,
//! and timeouts. Built at startup from the resolved configuration and
//! shared immutably behind `Arc`; workers own their connections
//! exclusively, so no host-level locking is needed after construction.

use crate::config::{Config, Limits, Timeouts};
use crate::http::request::Request;
use crate::pipeline::stage::Stage;
use crate::stages::chunk_filter::ChunkFilter;
use crate::stages::file_handler::FileHandler;
use crate::stages::net_connector::NetConnector;
use crate::stages::send_connector::SendConnector;
use std::path::PathBuf;
use std::sync::Arc;

/// Immutable engine-wide service state.
pub struct Host {
    pub name: String,
    pub root: PathBuf,
    pub limits: Limits,
    pub timeouts: Timeouts,
    /// Candidate handlers, consulted in registration order.
    handlers: Vec<Arc<dyn Stage>>,
    /// Output filters in pipeline order. The chunk filter stays last so
    /// framing is applied after any content transformation.
    filters: Vec<Arc<dyn Stage>>,
    net_connector: Arc<dyn Stage>,
    send_connector: Arc<dyn Stage>,
}

impl Host {
    /// Build a host with the default stage set: static file handler,
    /// chunk filter, and both connectors.
    pub fn new(config: &Config) -> Host {
        Host {
            name: config.listen.clone(),
            root: config.root.clone(),
            limits: config.limits.clone(),
            timeouts: config.timeouts.clone(),
            handlers: vec![Arc::new(FileHandler::new(config.root.clone()))],
            filters: vec![Arc::new(ChunkFilter)],
            net_connector: Arc::new(NetConnector),
            send_connector: Arc::new(SendConnector),
        }
    }

    /// Register an embedder handler. Later registrations take
    /// precedence over the built-in file handler.
    pub fn add_handler(&mut self, handler: Arc<dyn Stage>) {
        self.handlers.insert(0, handler);
    }

    /// Register an embedder filter, keeping the chunk filter last.
    pub fn add_filter(&mut self, filter: Arc<dyn Stage>) {
        let at = self.filters.len().saturating_sub(1);
        self.filters.insert(at, filter);
    }

    /// Select the handler for a request: the first registered handler
    /// whose method mask, extension list, and match predicate accept.
    /// `Err` carries the HTTP status to fail the request with.
    pub fn select_handler(&self, req: &Request) -> Result<Arc<dyn Stage>, u16> {
        let mut path_matched = false;
        for handler in &self.handlers {
            if !extension_ok(handler.as_ref(), req) || !handler.matches(req) {
                continue;
            }
            path_matched = true;
            if handler.methods() & req.method.mask() != 0 {
                return Ok(handler.clone());
            }
        }
        Err(if path_matched { 405 } else { 404 })
    }

    /// Fallback handler used to carry an error response through the
    /// pipeline when no handler accepted the request.
    pub fn fallback_handler(&self) -> Arc<dyn Stage> {
        self.handlers
            .last()
            .cloned()
            .expect("host always has the built-in file handler")
    }

    pub fn filters(&self) -> &[Arc<dyn Stage>] {
        &self.filters
    }

    pub fn net_connector(&self) -> Arc<dyn Stage> {
        self.net_connector.clone()
    }

    pub fn send_connector(&self) -> Arc<dyn Stage> {
        self.send_connector.clone()
    }
}

pub(crate) fn extension_ok(stage: &dyn Stage, req: &Request) -> bool {
    let exts = stage.extensions();
    if exts.is_empty() {
        return true;
    }
    match req.extension {
        Some(ref ext) => exts.iter().any(|e| e.eq_ignore_ascii_case(ext)),
        None => false,
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("handlers", &self.handlers.len())
            .field("filters", &self.filters.len())
            .finish()
    }
}
