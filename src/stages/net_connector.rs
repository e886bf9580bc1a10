//! Buffered-vector connector: the default terminal stage of the send
//! chain. Everything it transmits lives in packet buffers; partial
//! writes trim those buffers in place.

use crate::error::Result;
use crate::pipeline::queue::QueueId;
use crate::pipeline::stage::{Stage, StageKind};
use crate::pipeline::Cx;
use crate::stages::service_connector;

pub struct NetConnector;

impl Stage for NetConnector {
    fn name(&self) -> &'static str {
        "net"
    }

    fn kind(&self) -> StageKind {
        StageKind::Connector
    }

    fn outgoing_service(&self, cx: &mut Cx<'_>, q: QueueId) -> Result<()> {
        service_connector(cx, q, false)
    }
}
