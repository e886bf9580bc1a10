//! Request pipeline: packets, queues, stages, and the per-request
//! transaction context that ties them to the socket.
//!
//! Stage callbacks receive a `Cx` — a view over the transaction, the
//! transport, and the connection's notification flags. All queue
//! operations with cross-queue effects (scheduling, flow control,
//! dispatch to the next stage) live on `Cx` so stages never hold
//! references into the queue network across calls.

pub mod assemble;
pub mod packet;
pub mod queue;
pub mod stage;

pub use packet::{flags, Packet};
pub use queue::{Direction, Queue, QueueId, QueueNet};
pub use stage::{Stage, StageKind};

use crate::error::Result;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::runtime::transport::Transport;
use tracing::{debug, warn};

/// Per-request transaction: the parsed request, the response being
/// built, and the queue network moving data between them.
#[derive(Debug)]
pub struct Tx {
    pub req: Request,
    pub resp: Response,
    pub net: QueueNet,
    /// A failure was recorded; further handler output is suppressed.
    pub failed: bool,
    /// The connection itself is unusable; no response is attempted.
    pub connection_failed: bool,
    /// The connector transmitted the end-of-stream marker.
    pub completed: bool,
    /// Handler selection failed during assembly; the status to raise
    /// once the queues are open.
    pub pending_error: Option<u16>,
}

impl Tx {
    pub fn new(req: Request, resp: Response) -> Tx {
        Tx {
            req,
            resp,
            net: QueueNet::new(),
            failed: false,
            connection_failed: false,
            completed: false,
            pending_error: None,
        }
    }
}

/// Flags a service pass raises for the connection to act on.
#[derive(Debug, Default)]
pub struct Notify {
    /// A write would block; re-arm writable interest.
    pub want_write: bool,
    /// The connection must close (I/O failure, corrupt framing).
    pub close: bool,
}

/// Stage callback context: one transaction plus the connection's
/// transport and notification flags.
pub struct Cx<'a> {
    pub tx: &'a mut Tx,
    pub transport: &'a mut dyn Transport,
    pub notify: &'a mut Notify,
    /// Keep-alive advertisement for header emission
    /// (timeout seconds, requests remaining); `None` means close.
    pub keep_alive: Option<(u64, u32)>,
}

impl Cx<'_> {
    /// Append a packet to `q`, optionally scheduling it for service.
    /// Scheduling is idempotent and skipped while the queue is disabled.
    pub fn put_for_service(&mut self, q: QueueId, packet: Packet, schedule: bool) {
        self.tx.net.put(q, packet);
        if schedule {
            self.tx.net.schedule(q);
        }
    }

    /// Pop the head packet, releasing upstream back-pressure when the
    /// queue drains below its low-water mark.
    pub fn get(&mut self, q: QueueId) -> Option<Packet> {
        let packet = self.tx.net.pop(q)?;
        self.release(q);
        Some(packet)
    }

    /// Clear the FULL mark and re-enable the nearest upstream producer
    /// once this queue has drained below its low-water mark.
    pub fn release(&mut self, q: QueueId) {
        let queue = self.tx.net.queue(q);
        if queue.full && queue.count <= queue.low {
            self.tx.net.queue_mut(q).full = false;
            if let Some(prev) = self.tx.net.queue(q).prev {
                self.tx.net.enable(prev);
            }
        }
    }

    /// Hand a packet to the next queue's ingress callback.
    /// A packet leaving the end of a chain is dropped.
    pub fn put_next(&mut self, q: QueueId, packet: Packet) -> Result<()> {
        let Some(next) = self.tx.net.queue(q).next else {
            return Ok(());
        };
        let stage = self.tx.net.queue(next).stage.clone();
        match self.tx.net.queue(next).dir {
            Direction::Send => stage.outgoing_data(self, next, packet),
            Direction::Receive => stage.incoming_data(self, next, packet),
        }
    }

    /// Check whether the next queue can take `packet`. If not, try to
    /// split it so the head fits (the tail goes back to the head of
    /// `q`); if even a fragment will not fit, disable `q` and mark the
    /// next queue FULL.
    pub fn will_next_accept(&mut self, q: QueueId, packet: &mut Packet) -> bool {
        let Some(next) = self.tx.net.queue(q).next else {
            return true;
        };
        let nq = self.tx.net.queue(next);
        if packet.count == 0 || packet.count <= nq.room() {
            return true;
        }
        let size = nq.room().min(nq.packet_size);
        if size > 0 {
            if let Some(tail) = packet.split_off(size) {
                self.tx.net.put_front(q, tail);
                return true;
            }
        }
        self.tx.net.queue_mut(q).disabled = true;
        self.tx.net.queue_mut(next).full = true;
        false
    }

    /// Drain the service ring. Each queue is serviced at most once per
    /// ring membership; re-scheduling during service queues a fresh
    /// turn. Returns true if any queue was serviced.
    pub fn service_queues(&mut self) -> Result<bool> {
        let mut progressed = false;
        while let Some(q) = self.tx.net.next_for_service() {
            progressed = true;
            let stage = self.tx.net.queue(q).stage.clone();
            match self.tx.net.queue(q).dir {
                Direction::Send => stage.outgoing_service(self, q)?,
                Direction::Receive => stage.incoming_service(self, q)?,
            }
        }
        Ok(progressed)
    }

    /// Invoke `open` exactly once per queue: send chain first, then the
    /// receive chain, skipping a receive queue whose paired send queue
    /// already opened the shared stage.
    pub fn open_queues(&mut self) {
        let mut order = Vec::with_capacity(self.tx.net.len());
        let mut id = Some(self.tx.net.send_head);
        while let Some(q) = id {
            order.push(q);
            id = self.tx.net.queue(q).next;
        }
        let mut id = self.tx.net.recv_head;
        while let Some(q) = id {
            order.push(q);
            id = self.tx.net.queue(q).next;
        }

        for q in order {
            if self.tx.net.queue(q).opened {
                continue;
            }
            let pair_opened = self
                .tx
                .net
                .queue(q)
                .pair
                .map_or(false, |p| self.tx.net.queue(p).opened);
            self.tx.net.queue_mut(q).opened = true;
            if pair_opened {
                continue;
            }
            self.tx.net.queue_mut(q).owns_open = true;
            let stage = self.tx.net.queue(q).stage.clone();
            stage.open(self, q);
        }
    }

    /// Invoke `close` once for every stage that was opened.
    pub fn close_queues(&mut self) {
        for q in self.tx.net.ids().collect::<Vec<_>>() {
            if !self.tx.net.queue(q).opened {
                continue;
            }
            let owns = self.tx.net.queue(q).owns_open;
            self.tx.net.queue_mut(q).opened = false;
            self.tx.net.queue_mut(q).owns_open = false;
            if !owns {
                continue;
            }
            let stage = self.tx.net.queue(q).stage.clone();
            stage.close(self, q);
        }
    }

    /// Run the handler once, after the request is fully parsed.
    pub fn run_handler(&mut self) -> Result<()> {
        if self.tx.failed {
            return Ok(());
        }
        let q = self.tx.net.send_head;
        let stage = self.tx.net.queue(q).stage.clone();
        stage.run(self, q)
    }

    /// Feed a request body packet into the head of the receive chain.
    pub fn receive(&mut self, packet: Packet) -> Result<()> {
        let Some(head) = self.tx.net.recv_head else {
            return Ok(());
        };
        let stage = self.tx.net.queue(head).stage.clone();
        stage.incoming_data(self, head, packet)
    }

    /// Signal that the connector transmitted the end of the response.
    pub fn finalize(&mut self) {
        if !self.tx.completed {
            self.tx.completed = true;
            debug!(
                status = self.tx.resp.status,
                bytes = self.tx.resp.bytes_written,
                "response complete"
            );
        }
    }

    /// Record a request-scoped failure. Only the first call takes
    /// effect. If headers have not been flushed, pending output is
    /// replaced with a boilerplate error body; otherwise the body is
    /// simply truncated.
    pub fn fail_request(&mut self, status: u16, reason: &str) {
        if self.tx.resp.error.is_some() {
            return;
        }
        warn!(status, reason, "request failed");
        self.tx.resp.error = Some(status);
        self.tx.failed = true;

        let connector = self.tx.net.connector;
        if self.tx.resp.headers_emitted {
            // Too late to change the status line; terminate the stream.
            self.tx.resp.suppress_body = true;
            self.put_for_service(connector, Packet::end(), true);
            return;
        }

        // Discard pending response output and emit the error instead,
        // directly on the connector so mid-stream filters are bypassed.
        for id in self.tx.net.ids().collect::<Vec<_>>() {
            if self.tx.net.queue(id).dir == Direction::Send {
                while self.tx.net.pop(id).is_some() {}
            }
        }
        let body = Response::error_body(status);
        let resp = &mut self.tx.resp;
        resp.status = status;
        resp.chunked = false;
        resp.etag = None;
        resp.content_range = None;
        resp.content_type = Some("text/html".to_string());
        resp.content_length = Some(body.len() as u64);

        if !self.tx.resp.suppress_body {
            self.put_for_service(connector, Packet::from_buf(body), false);
        }
        self.put_for_service(connector, Packet::end(), true);
    }

    /// Record a connection-corrupting failure: implies request failure,
    /// discards all buffered pipeline data, disables keep-alive, and
    /// schedules the socket for close. No response is attempted.
    pub fn fail_connection(&mut self, status: u16, reason: &str) {
        if self.tx.connection_failed {
            return;
        }
        warn!(status, reason, "connection failed");
        self.tx.connection_failed = true;
        self.tx.failed = true;
        if self.tx.resp.error.is_none() {
            self.tx.resp.error = Some(status);
            self.tx.resp.status = status;
        }
        self.tx.net.discard_all();
        self.notify.close = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::http::parser::parse_request;
    use crate::pipeline::stage::forward_service;
    use crate::runtime::transport::mock::MockTransport;
    use std::sync::Arc;

    struct NullStage;

    impl Stage for NullStage {
        fn name(&self) -> &'static str {
            "null"
        }
        fn kind(&self) -> StageKind {
            StageKind::Filter
        }
    }

    fn tx_with_chain(maxes: &[usize], packet_size: usize) -> (Tx, Vec<QueueId>) {
        let req = parse_request(b"GET / HTTP/1.1\r\n\r\n", &Config::default().limits)
            .expect("valid request");
        let mut tx = Tx::new(req, crate::http::response::Response::new());
        let mut ids = Vec::new();
        for &max in maxes {
            ids.push(
                tx.net
                    .add(Arc::new(NullStage), Direction::Send, max, packet_size),
            );
        }
        tx.net.link(&ids);
        tx.net.send_head = ids[0];
        tx.net.connector = *ids.last().expect("chain is never empty");
        (tx, ids)
    }

    #[test]
    fn test_split_to_fit_downstream() {
        let (mut tx, ids) = tx_with_chain(&[1024, 64], 16);
        let mut transport = MockTransport::new();
        let mut notify = Notify::default();
        let mut cx = Cx {
            tx: &mut tx,
            transport: &mut transport,
            notify: &mut notify,
            keep_alive: None,
        };

        let mut packet = Packet::from_slice(&[b'x'; 100]);
        assert!(cx.will_next_accept(ids[0], &mut packet));
        // Head trimmed to the downstream fragment size; tail re-queued
        assert_eq!(packet.count, 16);
        assert_eq!(cx.tx.net.queue(ids[0]).count, 84);
    }

    #[test]
    fn test_backpressure_disable_and_release() {
        let (mut tx, ids) = tx_with_chain(&[1024, 64], 16);
        let mut transport = MockTransport::new();
        let mut notify = Notify::default();
        let mut cx = Cx {
            tx: &mut tx,
            transport: &mut transport,
            notify: &mut notify,
            keep_alive: None,
        };

        // Fill the downstream queue to capacity
        cx.tx.net.put(ids[1], Packet::from_slice(&[b'y'; 64]));

        let mut packet = Packet::from_slice(&[b'x'; 32]);
        assert!(!cx.will_next_accept(ids[0], &mut packet));
        assert!(cx.tx.net.queue(ids[0]).disabled);
        assert!(cx.tx.net.queue(ids[1]).full);

        // Draining below the low-water mark re-enables the producer
        let drained = cx.get(ids[1]).expect("queued packet");
        assert_eq!(drained.count, 64);
        assert!(!cx.tx.net.queue(ids[1]).full);
        assert!(!cx.tx.net.queue(ids[0]).disabled);
        assert!(cx.tx.net.queue(ids[0]).scheduled);
    }

    #[test]
    fn test_forward_service_stops_at_full_queue() {
        let (mut tx, ids) = tx_with_chain(&[1024, 8], 8);
        let mut transport = MockTransport::new();
        let mut notify = Notify::default();
        let mut cx = Cx {
            tx: &mut tx,
            transport: &mut transport,
            notify: &mut notify,
            keep_alive: None,
        };

        cx.tx.net.put(ids[0], Packet::from_slice(&[b'a'; 8]));
        cx.tx.net.put(ids[0], Packet::from_slice(&[b'b'; 8]));
        forward_service(&mut cx, ids[0]).expect("service");

        // First packet forwarded, second held behind back-pressure
        assert_eq!(cx.tx.net.queue(ids[1]).count, 8);
        assert_eq!(cx.tx.net.queue(ids[0]).count, 8);
        assert!(cx.tx.net.queue(ids[0]).disabled);
    }

    #[test]
    fn test_fail_request_is_idempotent() {
        let (mut tx, ids) = tx_with_chain(&[1024, 1024], 64);
        let mut transport = MockTransport::new();
        let mut notify = Notify::default();
        let mut cx = Cx {
            tx: &mut tx,
            transport: &mut transport,
            notify: &mut notify,
            keep_alive: None,
        };

        cx.fail_request(404, "missing");
        cx.fail_request(500, "later failure");

        assert_eq!(cx.tx.resp.error, Some(404));
        assert_eq!(cx.tx.resp.status, 404);
        assert!(cx.tx.failed);
        // Error body and end marker staged directly on the connector
        let connector = ids[1];
        assert!(cx.tx.net.queue(connector).packet_count() >= 2);
    }

    #[test]
    fn test_fail_request_after_headers_truncates() {
        let (mut tx, ids) = tx_with_chain(&[1024, 1024], 64);
        tx.resp.headers_emitted = true;
        tx.net.put(ids[1], Packet::from_slice(b"partial body"));
        let mut transport = MockTransport::new();
        let mut notify = Notify::default();
        let mut cx = Cx {
            tx: &mut tx,
            transport: &mut transport,
            notify: &mut notify,
            keep_alive: None,
        };

        cx.fail_request(500, "mid-stream failure");

        // Status line already gone: the stream just ends
        assert!(cx.tx.resp.suppress_body);
        assert_eq!(cx.tx.resp.status, 200);
        assert!(cx
            .tx
            .net
            .queue(ids[1])
            .packets()
            .any(|p| p.is_end()));
    }

    #[test]
    fn test_fail_connection_discards_everything() {
        let (mut tx, ids) = tx_with_chain(&[1024, 1024], 64);
        tx.net.put(ids[0], Packet::from_slice(b"pending"));
        let mut transport = MockTransport::new();
        let mut notify = Notify::default();
        let mut cx = Cx {
            tx: &mut tx,
            transport: &mut transport,
            notify: &mut notify,
            keep_alive: None,
        };

        cx.fail_connection(400, "corrupt framing");
        cx.fail_connection(500, "second report");

        assert!(cx.tx.connection_failed);
        assert_eq!(cx.tx.resp.error, Some(400));
        assert!(cx.notify.close);
        assert!(cx.tx.net.queue(ids[0]).is_empty());
        assert!(cx.tx.net.queue(ids[1]).is_empty());
    }
}
