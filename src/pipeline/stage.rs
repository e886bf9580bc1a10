//! Stage contract: the extension point handlers, filters, and
//! connectors implement.
//!
//! Stages are immutable templates shared across requests as
//! `Arc<dyn Stage>`; anything mutable per-request lives in the queue's
//! `stage_state` or on the Request/Response. Default callback
//! implementations give filters pass-through behavior and handlers
//! body buffering, so simple stages override only what they need.

use crate::error::Result;
use crate::http::request::{method_mask, Request};
use crate::pipeline::packet::Packet;
use crate::pipeline::queue::QueueId;
use crate::pipeline::Cx;

/// Stage capability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Handler,
    Filter,
    Connector,
}

/// A pluggable processing unit in the request pipeline.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> StageKind;

    /// Method capability bits; a stage is only assembled into a
    /// pipeline for methods it declares.
    fn methods(&self) -> u8 {
        method_mask::ALL
    }

    /// Extension-based match list. Empty means no extension constraint.
    fn extensions(&self) -> &[&str] {
        &[]
    }

    /// Filters that also process request body data join the receive
    /// chain when this returns true.
    fn incoming(&self) -> bool {
        false
    }

    /// Custom applicability predicate, consulted during assembly after
    /// the method and extension checks.
    fn matches(&self, _req: &Request) -> bool {
        true
    }

    /// Called once per request when the queue activates. May adjust
    /// the queue's `packet_size` and `max`.
    fn open(&self, _cx: &mut Cx<'_>, _q: QueueId) {}

    /// Called once at request completion for every opened queue.
    fn close(&self, _cx: &mut Cx<'_>, _q: QueueId) {}

    /// Invoked once for the handler after the request is fully parsed
    /// (immediately, when there is no body). Produces the initial
    /// response packets.
    fn run(&self, _cx: &mut Cx<'_>, _q: QueueId) -> Result<()> {
        Ok(())
    }

    /// Ingress for body bytes flowing toward the handler. Filters and
    /// connectors forward; the handler buffers until the end-of-stream
    /// marker, then decodes urlencoded form bodies.
    fn incoming_data(&self, cx: &mut Cx<'_>, q: QueueId, packet: Packet) -> Result<()> {
        match self.kind() {
            StageKind::Handler => {
                if packet.is_end() {
                    cx.tx.req.body_complete = true;
                    if cx.tx.req.is_form() {
                        let body = cx.tx.req.body.clone();
                        cx.tx.req.form = decode_form(&body);
                    }
                } else if let Some(ref content) = packet.content {
                    cx.tx.req.body.extend_from_slice(content);
                }
                Ok(())
            }
            _ => cx.put_next(q, packet),
        }
    }

    /// Ingress for response bytes flowing toward the connector.
    /// Default: enqueue for service.
    fn outgoing_data(&self, cx: &mut Cx<'_>, q: QueueId, packet: Packet) -> Result<()> {
        cx.put_for_service(q, packet, true);
        Ok(())
    }

    /// Drain routine for the receive direction.
    fn incoming_service(&self, cx: &mut Cx<'_>, q: QueueId) -> Result<()> {
        forward_service(cx, q)
    }

    /// Drain routine for the send direction. Default: forward every
    /// packet downstream subject to flow control.
    fn outgoing_service(&self, cx: &mut Cx<'_>, q: QueueId) -> Result<()> {
        forward_service(cx, q)
    }
}

impl std::fmt::Debug for dyn Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stage({})", self.name())
    }
}

/// Forward packets to the next queue until it stops accepting. A
/// rejected packet goes back to the head of the queue for the next
/// service turn.
pub fn forward_service(cx: &mut Cx<'_>, q: QueueId) -> Result<()> {
    while let Some(mut packet) = cx.get(q) {
        if !cx.will_next_accept(q, &mut packet) {
            cx.tx.net.put_front(q, packet);
            break;
        }
        cx.put_next(q, packet)?;
    }
    Ok(())
}

/// Decode an `application/x-www-form-urlencoded` body.
fn decode_form(body: &[u8]) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    for pair in body.split(|&b| b == b'&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.iter().position(|&b| b == b'=') {
            Some(eq) => (&pair[..eq], &pair[eq + 1..]),
            None => (pair, &pair[0..0]),
        };
        fields.push((decode_component(key), decode_component(value)));
    }
    fields
}

fn decode_component(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < raw.len() => {
                let hi = (raw[i + 1] as char).to_digit(16);
                let lo = (raw[i + 2] as char).to_digit(16);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                    continue;
                }
                out.push(b'%');
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_form() {
        let fields = decode_form(b"name=Jo+Smith&tag=a%26b&flag");
        assert_eq!(
            fields,
            vec![
                ("name".to_string(), "Jo Smith".to_string()),
                ("tag".to_string(), "a&b".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_decode_component_bad_escape() {
        assert_eq!(decode_component(b"a%zz"), "a%zz");
        assert_eq!(decode_component(b"a%2"), "a%2");
    }
}
