//! Output framing filter.
//!
//! Decides the response's length framing the first time output is
//! serviced, before any header byte is emitted:
//!
//!   - a declared Content-Length (or suppressed body) passes through
//!     untouched;
//!   - a stream whose end marker is already buffered gets its length
//!     computed and declared, avoiding chunk overhead entirely;
//!   - otherwise the body is chunked, except to an HTTP/1.0 peer,
//!     where the close delimits the body instead.
//!
//! In chunked mode each forwarded data packet is prefixed with its
//! boundary line after flow-control splitting, so the declared size
//! always matches the bytes that follow.

use crate::error::Result;
use crate::http::request::Version;
use crate::pipeline::packet::Packet;
use crate::pipeline::queue::QueueId;
use crate::pipeline::stage::{Stage, StageKind};
use crate::pipeline::Cx;
use bytes::BytesMut;
use tracing::debug;

pub struct ChunkFilter;

/// Sentinel stored in the queue's stage state once framing is decided.
struct FramingDecided;

impl Stage for ChunkFilter {
    fn name(&self) -> &'static str {
        "chunk"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn outgoing_service(&self, cx: &mut Cx<'_>, q: QueueId) -> Result<()> {
        if cx.tx.net.queue(q).stage_state.is_none() {
            decide_framing(cx, q);
            cx.tx.net.queue_mut(q).stage_state = Some(Box::new(FramingDecided));
        }
        let chunked = cx.tx.resp.chunked;

        while let Some(mut packet) = cx.get(q) {
            if !cx.will_next_accept(q, &mut packet) {
                cx.tx.net.put_front(q, packet);
                break;
            }
            if chunked {
                frame(&mut packet);
            }
            cx.put_next(q, packet)?;
        }
        Ok(())
    }
}

/// Attach the boundary line for one packet. The leading CRLF closes the
/// previous chunk; for the first chunk it completes the header block,
/// which omits its final CRLF when the body is chunked.
fn frame(packet: &mut Packet) {
    if packet.is_end() {
        packet.prefix = Some(BytesMut::from(&b"\r\n0\r\n\r\n"[..]));
    } else if packet.count > 0 {
        let line = format!("\r\n{:x}\r\n", packet.count);
        packet.prefix = Some(BytesMut::from(line.as_bytes()));
    }
}

fn decide_framing(cx: &mut Cx<'_>, q: QueueId) {
    let resp = &cx.tx.resp;
    if resp.content_length.is_some() || resp.suppress_body || resp.close_delimited {
        return;
    }

    // Whole stream already buffered: declare its length instead of
    // paying chunk overhead.
    let queue = cx.tx.net.queue(q);
    if queue.packets().any(|p| p.is_end()) {
        let total: u64 = queue
            .packets()
            .filter(|p| !p.is_header())
            .map(|p| p.count as u64)
            .sum();
        cx.tx.resp.content_length = Some(total);
        debug!(length = total, "declared buffered stream length");
        return;
    }

    if cx.tx.req.version == Version::Http10 {
        cx.tx.resp.close_delimited = true;
        return;
    }
    cx.tx.resp.chunked = true;
}
