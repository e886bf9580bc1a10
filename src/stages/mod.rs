//! Built-in pipeline stages: the static file handler, the chunk
//! filter, and the two connectors that put bytes on the wire.
//!
//! The connectors share one service routine; they differ only in
//! whether a file-backed span may reach the socket directly.

pub mod chunk_filter;
pub mod file_handler;
pub mod net_connector;
pub mod send_connector;

use crate::error::{EngineError, Result};
use crate::pipeline::packet::Packet;
use crate::pipeline::queue::{QueueId, QueueNet};
use crate::pipeline::Cx;
use bytes::Buf;
use std::io::{self, IoSlice};
use tracing::trace;

/// Upper bound on I/O vector entries per write. Each packet can
/// contribute a framing prefix and a content slice.
const MAX_IOVS: usize = 16;

/// Connector service loop shared by both connectors.
///
/// Materializes the header block on first output, drops body data for
/// suppressed responses, then writes buffered bytes with scatter-gather
/// writes until the socket blocks or the stream's end marker has gone
/// out. With `allow_virtual`, a file-backed span at the head of the
/// queue is transmitted straight from its file.
pub(crate) fn service_connector(cx: &mut Cx<'_>, q: QueueId, allow_virtual: bool) -> Result<()> {
    if cx.tx.connection_failed {
        return Ok(());
    }
    loop {
        if !cx.tx.resp.headers_emitted && !cx.tx.net.queue(q).is_empty() {
            let version = cx.tx.req.version;
            let keep_alive = cx.keep_alive;
            let block = cx.tx.resp.format_headers(version, keep_alive);
            cx.tx.net.put_front(q, Packet::header(block));
        }
        if cx.tx.resp.suppress_body {
            cx.tx.net.drop_data(q);
        }

        let front_virtual = {
            let Some(front) = cx.tx.net.queue(q).first() else {
                break;
            };
            if front.is_end() && front.wire_len() == 0 {
                let _ = cx.tx.net.pop(q);
                cx.finalize();
                break;
            }
            front.is_virtual()
        };

        if front_virtual {
            if !allow_virtual {
                cx.fail_connection(500, "file span reached the buffered connector");
                return Ok(());
            }
            if !send_file_front(cx, q)? {
                break;
            }
            continue;
        }

        let result = {
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_IOVS);
            for p in cx.tx.net.queue(q).packets() {
                if p.is_virtual() || slices.len() + 2 > MAX_IOVS {
                    break;
                }
                if let Some(ref prefix) = p.prefix {
                    if !prefix.is_empty() {
                        slices.push(IoSlice::new(prefix));
                    }
                }
                if let Some(ref content) = p.content {
                    if !content.is_empty() {
                        slices.push(IoSlice::new(content));
                    }
                }
                if p.is_end() {
                    break;
                }
            }
            if slices.is_empty() {
                // Zero-wire packet at the head that is neither the end
                // marker nor virtual; discard it.
                drop(slices);
                let _ = cx.tx.net.pop(q);
                continue;
            }
            cx.transport.write_vectored(&slices)
        };

        match result {
            Ok(0) => {
                cx.notify.want_write = true;
                break;
            }
            Ok(n) => {
                trace!(bytes = n, "wrote");
                consume(&mut cx.tx.net, q, n);
                cx.tx.resp.bytes_written += n as u64;
                cx.release(q);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                cx.notify.want_write = true;
                break;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let reason = match EngineError::from_io(e) {
                    EngineError::PeerClosed => "peer closed during write",
                    _ => "socket write failed",
                };
                cx.fail_connection(500, reason);
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Transmit the file-backed span at the head of `q`. Returns false when
/// the socket blocked and the span must wait for writable.
fn send_file_front(cx: &mut Cx<'_>, q: QueueId) -> Result<bool> {
    let len = cx
        .tx
        .net
        .queue(q)
        .first()
        .map_or(0, |p| p.count);
    let pos = cx.tx.resp.pos;
    let result = match cx.tx.resp.file {
        Some(ref file) => cx.transport.send_file(file, pos, len),
        None => {
            cx.fail_connection(500, "file span without a backing file");
            return Ok(false);
        }
    };

    match result {
        Ok(0) => {
            cx.notify.want_write = true;
            Ok(false)
        }
        Ok(n) => {
            trace!(bytes = n, pos, "sent file span");
            cx.tx.resp.pos += n as u64;
            cx.tx.resp.bytes_written += n as u64;
            let span_done = {
                let queue = cx.tx.net.queue_mut(q);
                queue.count -= n;
                match queue.first_mut() {
                    Some(front) => {
                        front.count -= n;
                        front.count == 0
                    }
                    None => false,
                }
            };
            if span_done {
                let _ = cx.tx.net.pop(q);
            }
            cx.release(q);
            Ok(true)
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
            cx.notify.want_write = true;
            Ok(false)
        }
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
        Err(e) => {
            let reason = match EngineError::from_io(e) {
                EngineError::PeerClosed => "peer closed during file send",
                _ => "file send failed",
            };
            cx.fail_connection(500, reason);
            Ok(false)
        }
    }
}

/// Advance the head of `q` past `n` written bytes, trimming buffers in
/// place so no byte is ever copied again. Framing prefixes are consumed
/// before content and never count toward queue byte accounting.
pub(crate) fn consume(net: &mut QueueNet, q: QueueId, mut n: usize) {
    while n > 0 {
        let mut taken = 0;
        let mut content_taken = 0;
        let mut exhausted = false;
        {
            let Some(front) = net.queue_mut(q).first_mut() else {
                break;
            };
            if front.is_virtual() {
                break;
            }
            if let Some(ref mut prefix) = front.prefix {
                let k = prefix.len().min(n);
                prefix.advance(k);
                taken += k;
                if prefix.is_empty() {
                    front.prefix = None;
                }
            }
            if let Some(ref mut content) = front.content {
                let k = content.len().min(n - taken);
                content.advance(k);
                front.count -= k;
                taken += k;
                content_taken = k;
            }
            exhausted = front.wire_len() == 0 && !front.is_end();
        }
        net.queue_mut(q).count -= content_taken;
        if exhausted {
            let _ = net.pop(q);
        }
        if taken == 0 {
            break;
        }
        n -= taken;
    }
}

/// Queue an end-of-stream marker behind existing output.
pub(crate) fn put_end(cx: &mut Cx<'_>, q: QueueId) {
    cx.put_for_service(q, Packet::end(), true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::Direction;
    use crate::pipeline::stage::{Stage, StageKind};
    use bytes::BytesMut;
    use std::sync::Arc;

    struct NullStage;

    impl Stage for NullStage {
        fn name(&self) -> &'static str {
            "null"
        }
        fn kind(&self) -> StageKind {
            StageKind::Connector
        }
    }

    fn net_with_queue() -> (QueueNet, QueueId) {
        let mut net = QueueNet::new();
        let id = net.add(Arc::new(NullStage), Direction::Send, 1024, 64);
        (net, id)
    }

    #[test]
    fn test_consume_across_packets() {
        let (mut net, q) = net_with_queue();
        net.put(q, Packet::from_slice(b"hello"));
        net.put(q, Packet::from_slice(b"world"));

        consume(&mut net, q, 7);
        assert_eq!(net.queue(q).count, 3);
        assert_eq!(net.queue(q).packet_count(), 1);
        assert_eq!(
            &net.queue(q).first().unwrap().content.as_ref().unwrap()[..],
            b"rld"
        );
    }

    #[test]
    fn test_consume_prefix_before_content() {
        let (mut net, q) = net_with_queue();
        let mut p = Packet::from_slice(b"abc");
        p.prefix = Some(BytesMut::from(&b"\r\n3\r\n"[..]));
        net.put(q, p);

        // 5 prefix bytes plus one content byte
        consume(&mut net, q, 6);
        let front = net.queue(q).first().unwrap();
        assert!(front.prefix.is_none());
        assert_eq!(&front.content.as_ref().unwrap()[..], b"bc");
        assert_eq!(net.queue(q).count, 2);
    }

    #[test]
    fn test_consume_stops_at_virtual() {
        let (mut net, q) = net_with_queue();
        net.put(q, Packet::from_slice(b"ab"));
        net.put(q, Packet::file_span(100));

        consume(&mut net, q, 50);
        assert_eq!(net.queue(q).packet_count(), 1);
        assert!(net.queue(q).first().unwrap().is_virtual());
        assert_eq!(net.queue(q).count, 100);
    }

    #[test]
    fn test_consume_leaves_end_marker() {
        let (mut net, q) = net_with_queue();
        net.put(q, Packet::from_slice(b"ab"));
        net.put(q, Packet::end());

        consume(&mut net, q, 2);
        assert_eq!(net.queue(q).packet_count(), 1);
        assert!(net.queue(q).first().unwrap().is_end());
    }
}
