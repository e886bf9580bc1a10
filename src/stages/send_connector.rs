//! Sendfile-style connector for plain static file responses.
//!
//! Buffered bytes (the header block) go out through the same vectored
//! write path as the buffered connector; a file-backed span at the head
//! of the queue is handed to the transport's file-transmit primitive,
//! one span per call, with the read offset tracked on the response.

use crate::error::Result;
use crate::pipeline::queue::QueueId;
use crate::pipeline::stage::{Stage, StageKind};
use crate::pipeline::Cx;
use crate::stages::service_connector;

pub struct SendConnector;

impl Stage for SendConnector {
    fn name(&self) -> &'static str {
        "sendfile"
    }

    fn kind(&self) -> StageKind {
        StageKind::Connector
    }

    fn outgoing_service(&self, cx: &mut Cx<'_>, q: QueueId) -> Result<()> {
        service_connector(cx, q, true)
    }
}
