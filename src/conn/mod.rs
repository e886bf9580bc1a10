//! Per-connection state machine.
//!
//! A connection cycles through phases: accumulate and parse a header
//! block (`Begin`), deliver body bytes (`Content` for a declared
//! length, `Chunk` for chunked framing), drive the pipeline until the
//! response is fully transmitted (`Processing`), then account for the
//! finished exchange (`Complete`) and either re-enter `Begin` for the
//! next keep-alive request or close.
//!
//! The machine is driven entirely by `ready` calls from the event loop;
//! it never blocks, and reports back which interests to re-arm.

use crate::error::EngineError;
use crate::host::Host;
use crate::http::chunk::{ChunkDecoder, ChunkEvent};
use crate::http::headers::HeaderMap;
use crate::http::parser::{find_header_end, parse_request};
use crate::http::request::{Method, Request, Version};
use crate::pipeline::{assemble, Cx, Notify, Packet, Tx};
use crate::runtime::transport::Transport;
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

/// Where the connection is in the request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Accumulating a header block.
    Begin,
    /// Reading a declared-length body.
    Content,
    /// Decoding a chunked body.
    Chunk,
    /// Servicing pipeline queues until the response completes.
    Processing,
    /// Response transmitted; account and decide keep-alive.
    Complete,
}

/// What the event loop should do with the connection next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the connection registered with these interests.
    Continue { readable: bool, writable: bool },
    /// Deregister and drop the connection (after `drain`).
    Close,
}

/// One client connection and its in-flight request, if any.
pub struct Conn<T: Transport> {
    transport: T,
    host: Arc<Host>,
    input: BytesMut,
    phase: Phase,
    tx: Option<Tx>,
    chunk: Option<ChunkDecoder>,
    /// Declared body bytes still expected in `Content` phase.
    remaining_content: u64,
    /// Chunked body bytes accepted so far, against the body limit.
    body_received: u64,
    /// Requests this connection may still serve.
    requests_left: u32,
    /// Keep-alive advertisement for the current request.
    ka: Option<(u64, u32)>,
    /// Absolute deadline; the sweep closes the connection past it.
    expire: Instant,
    started: Instant,
    peer_eof: bool,
}

impl<T: Transport> Conn<T> {
    pub fn new(transport: T, host: Arc<Host>, now: Instant) -> Conn<T> {
        let requests_left = host.timeouts.max_keep_alive;
        let expire = now + host.timeouts.inactivity;
        Conn {
            transport,
            host,
            input: BytesMut::new(),
            phase: Phase::Begin,
            tx: None,
            chunk: None,
            remaining_content: 0,
            body_received: 0,
            requests_left,
            ka: None,
            expire,
            started: now,
            peer_eof: false,
        }
    }

    /// True once the connection has outlived its deadline.
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.expire
    }

    /// Drive the machine for one readiness event.
    pub fn ready(&mut self, readable: bool, writable: bool, now: Instant) -> Disposition {
        if self.expired(now) {
            debug!("connection timed out");
            return Disposition::Close;
        }

        let mut notify = Notify::default();

        if readable {
            if let Err(e) = self.fill_input() {
                debug!(error = %e, "read failed");
                return Disposition::Close;
            }
            self.expire = now + self.host.timeouts.inactivity;
        }

        if writable {
            if let Some(tx) = self.tx.as_mut() {
                let connector = tx.net.connector;
                tx.net.schedule(connector);
            }
        }

        loop {
            let progressed = match self.phase {
                Phase::Begin => self.step_begin(&mut notify, now),
                Phase::Content => self.step_content(&mut notify),
                Phase::Chunk => self.step_chunk(&mut notify),
                Phase::Processing => self.step_processing(&mut notify, now),
                Phase::Complete => self.step_complete(&mut notify, now),
            };
            if notify.close || !progressed {
                break;
            }
        }

        if notify.close {
            Disposition::Close
        } else {
            // Keep writable interest while the connector holds bytes it
            // could not flush, not just when this pass blocked.
            let pending_output = self
                .tx
                .as_ref()
                .map_or(false, |tx| !tx.net.queue(tx.net.connector).is_empty());
            // Input is wanted only while a request or body is being
            // received; during transmission the peer's pipelined bytes
            // stay in the kernel buffer instead of growing ours.
            let receiving = matches!(self.phase, Phase::Begin | Phase::Content | Phase::Chunk);
            Disposition::Continue {
                readable: receiving,
                writable: notify.want_write || pending_output,
            }
        }
    }

    /// Flush whatever the pipeline still holds, switching the socket to
    /// blocking mode. Called once by the owner right before close so a
    /// completed response is not lost to a full socket buffer.
    pub fn drain(&mut self) {
        let Some(tx) = self.tx.as_mut() else {
            return;
        };
        if tx.connection_failed || tx.completed {
            return;
        }
        if self.transport.set_blocking(true).is_err() {
            return;
        }
        let mut notify = Notify::default();
        for _ in 0..64 {
            notify.want_write = false;
            let connector = tx.net.connector;
            tx.net.schedule(connector);
            let mut cx = Cx {
                tx: &mut *tx,
                transport: &mut self.transport,
                notify: &mut notify,
                keep_alive: self.ka,
            };
            let progressed = cx.service_queues().unwrap_or(false);
            if tx.completed || notify.close || !progressed {
                break;
            }
        }
    }

    fn fill_input(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match self.transport.read(&mut buf) {
                Ok(0) => {
                    self.peer_eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    trace!(bytes = n, "read");
                    self.input.extend_from_slice(&buf[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn step_begin(&mut self, notify: &mut Notify, now: Instant) -> bool {
        let Some(end) = find_header_end(&self.input) else {
            if self.input.len() > self.host.limits.max_header_size {
                self.begin_failed(431, notify, now);
                return true;
            }
            if self.peer_eof {
                // Clean close between requests; a truncated header
                // block gets no response either way.
                notify.close = true;
            }
            return false;
        };
        if end > self.host.limits.max_header_size {
            self.begin_failed(431, notify, now);
            return true;
        }

        let block = self.input.split_to(end);
        match parse_request(&block, &self.host.limits) {
            Ok(req) => self.begin_tx(req, None, notify, now),
            Err(e) => {
                debug!(error = %e, "request rejected");
                self.begin_failed(e.status(), notify, now);
            }
        }
        true
    }

    /// Start an error-only exchange for input that never became a
    /// request. Body framing is unknown, so the connection closes after
    /// the response.
    fn begin_failed(&mut self, status: u16, notify: &mut Notify, now: Instant) {
        let req = Request {
            method: Method::Get,
            uri: "/".to_string(),
            path: "/".to_string(),
            query: None,
            version: Version::Http11,
            headers: HeaderMap::new(),
            content_length: None,
            chunked: false,
            range: None,
            keep_alive: false,
            extension: None,
            body: BytesMut::new(),
            body_complete: true,
            form: Vec::new(),
        };
        self.begin_tx(req, Some(status), notify, now);
    }

    fn begin_tx(&mut self, req: Request, forced: Option<u16>, notify: &mut Notify, now: Instant) {
        self.started = now;
        self.ka = if req.keep_alive && self.requests_left > 1 {
            Some((
                self.host.timeouts.keep_alive.as_secs(),
                self.requests_left - 1,
            ))
        } else {
            None
        };

        let secure = self.transport.is_secure();
        let mut tx = assemble::build(&self.host, req, secure);
        let pending = forced.or(tx.pending_error);
        let chunked = tx.req.chunked;
        let content_length = tx.req.content_length.unwrap_or(0);

        {
            let mut cx = Cx {
                tx: &mut tx,
                transport: &mut self.transport,
                notify,
                keep_alive: self.ka,
            };
            cx.open_queues();
            if let Some(status) = pending {
                cx.fail_request(status, "request refused");
            }

            if forced.is_some() {
                // Unknowable body framing: answer and close.
                self.phase = Phase::Processing;
            } else if chunked {
                self.chunk = Some(ChunkDecoder::new());
                self.body_received = 0;
                self.phase = Phase::Chunk;
            } else if content_length > 0 {
                self.remaining_content = content_length;
                self.phase = Phase::Content;
            } else {
                if let Err(e) = cx.run_handler() {
                    fail_with(&mut cx, e, "handler failure");
                }
                self.phase = Phase::Processing;
            }
        }
        self.tx = Some(tx);
    }

    fn step_content(&mut self, notify: &mut Notify) -> bool {
        let Some(tx) = self.tx.as_mut() else {
            notify.close = true;
            return false;
        };
        let mut cx = Cx {
            tx,
            transport: &mut self.transport,
            notify,
            keep_alive: self.ka,
        };

        let take = (self.input.len() as u64).min(self.remaining_content) as usize;
        let mut progressed = false;
        if take > 0 {
            let data = self.input.split_to(take);
            self.remaining_content -= take as u64;
            if let Err(e) = cx.receive(Packet::from_buf(data)) {
                fail_with(&mut cx, e, "body delivery failed");
                // Unread body bytes make the stream unusable for a
                // further request.
                self.ka = None;
                self.phase = Phase::Processing;
                return true;
            }
            progressed = true;
        }

        if self.remaining_content == 0 {
            let _ = cx.receive(Packet::end());
            if let Err(e) = cx.run_handler() {
                fail_with(&mut cx, e, "handler failure");
            }
            self.phase = Phase::Processing;
            return true;
        }
        if self.peer_eof {
            cx.fail_connection(400, "peer closed mid-body");
            return false;
        }
        progressed
    }

    fn step_chunk(&mut self, notify: &mut Notify) -> bool {
        let Some(tx) = self.tx.as_mut() else {
            notify.close = true;
            return false;
        };
        let Some(decoder) = self.chunk.as_mut() else {
            notify.close = true;
            return false;
        };
        let mut cx = Cx {
            tx,
            transport: &mut self.transport,
            notify,
            keep_alive: self.ka,
        };

        let mut progressed = false;
        loop {
            match decoder.decode(&mut self.input) {
                Ok(ChunkEvent::Data(data)) => {
                    self.body_received += data.len() as u64;
                    if self.body_received > self.host.limits.max_body_size {
                        cx.fail_connection(413, "chunked body exceeds limit");
                        return false;
                    }
                    if let Err(e) = cx.receive(Packet::from_buf(data)) {
                        fail_with(&mut cx, e, "body delivery failed");
                        self.ka = None;
                        self.phase = Phase::Processing;
                        return true;
                    }
                    progressed = true;
                }
                Ok(ChunkEvent::End) => {
                    let _ = cx.receive(Packet::end());
                    if let Err(e) = cx.run_handler() {
                        fail_with(&mut cx, e, "handler failure");
                    }
                    self.chunk = None;
                    self.phase = Phase::Processing;
                    return true;
                }
                Ok(ChunkEvent::NeedMore) => {
                    if self.peer_eof {
                        cx.fail_connection(400, "peer closed mid-body");
                        return false;
                    }
                    return progressed;
                }
                Err(e) => {
                    debug!(error = %e, "chunk framing error");
                    cx.fail_connection(400, "malformed chunk framing");
                    return false;
                }
            }
        }
    }

    fn step_processing(&mut self, notify: &mut Notify, now: Instant) -> bool {
        let Some(tx) = self.tx.as_mut() else {
            notify.close = true;
            return false;
        };

        let written_before = tx.resp.bytes_written;
        let (progressed, completed) = {
            let mut cx = Cx {
                tx: &mut *tx,
                transport: &mut self.transport,
                notify,
                keep_alive: self.ka,
            };
            let progressed = match cx.service_queues() {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "service failure");
                    cx.fail_connection(500, "service failure");
                    false
                }
            };
            (progressed, cx.tx.completed)
        };

        // Write progress counts as activity: a slow reader must not
        // trip the inactivity deadline while the transfer advances.
        if tx.resp.bytes_written > written_before {
            self.expire = now + self.host.timeouts.inactivity;
        }

        if completed {
            self.phase = Phase::Complete;
            return true;
        }
        progressed && tx.net.has_scheduled()
    }

    fn step_complete(&mut self, notify: &mut Notify, now: Instant) -> bool {
        let Some(mut tx) = self.tx.take() else {
            notify.close = true;
            return false;
        };

        {
            let mut cx = Cx {
                tx: &mut tx,
                transport: &mut self.transport,
                notify,
                keep_alive: self.ka,
            };
            cx.close_queues();
        }

        info!(
            target: "access",
            peer = %self.transport.peer_addr().map_or_else(|| "-".to_string(), |a| a.to_string()),
            method = tx.req.method.as_str(),
            uri = %tx.req.uri,
            status = tx.resp.status,
            bytes = tx.resp.bytes_written,
            elapsed_ms = now.saturating_duration_since(self.started).as_millis() as u64,
            "request"
        );

        let keep = self.ka.is_some() && !tx.connection_failed && !tx.resp.close_delimited;
        self.chunk = None;
        drop(tx);

        if keep {
            self.requests_left = self.requests_left.saturating_sub(1);
            self.expire = now + self.host.timeouts.keep_alive;
            self.phase = Phase::Begin;
            true
        } else {
            notify.close = true;
            false
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

/// Record a stage failure, honoring the status a typed request error
/// carries; anything else answers 500.
fn fail_with(cx: &mut Cx<'_>, e: EngineError, reason: &str) {
    debug!(error = %e, "stage failed");
    let status = match e {
        EngineError::Request { status, .. } => status,
        _ => 500,
    };
    cx.fail_request(status, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Result;
    use crate::http::request::method_mask;
    use crate::pipeline::queue::QueueId;
    use crate::pipeline::stage::{Stage, StageKind};
    use crate::runtime::transport::mock::MockTransport;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    /// Test handler: echoes the buffered request body back.
    struct EchoHandler;

    impl Stage for EchoHandler {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn kind(&self) -> StageKind {
            StageKind::Handler
        }
        fn methods(&self) -> u8 {
            method_mask::POST | method_mask::PUT
        }
        fn run(&self, cx: &mut Cx<'_>, q: QueueId) -> Result<()> {
            let body = cx.tx.req.body.clone();
            cx.tx.resp.content_type = Some("text/plain".to_string());
            if !body.is_empty() {
                cx.put_for_service(q, Packet::from_buf(body), false);
            }
            cx.put_for_service(q, Packet::end(), true);
            Ok(())
        }
    }

    /// Test handler that refuses service with a typed status.
    struct BusyHandler;

    impl Stage for BusyHandler {
        fn name(&self) -> &'static str {
            "busy"
        }
        fn kind(&self) -> StageKind {
            StageKind::Handler
        }
        fn matches(&self, req: &Request) -> bool {
            req.path == "/busy"
        }
        fn run(&self, _cx: &mut Cx<'_>, _q: QueueId) -> Result<()> {
            Err(EngineError::request(503, "over capacity"))
        }
    }

    fn host_with_root(root: &Path) -> Arc<Host> {
        let mut config = Config::default();
        config.root = root.to_path_buf();
        let mut host = Host::new(&config);
        host.add_handler(Arc::new(EchoHandler));
        host.add_handler(Arc::new(BusyHandler));
        Arc::new(host)
    }

    fn conn_for(root: &Path) -> Conn<MockTransport> {
        Conn::new(MockTransport::new(), host_with_root(root), Instant::now())
    }

    fn written(conn: &mut Conn<MockTransport>) -> String {
        String::from_utf8_lossy(&conn.transport_mut().written).into_owned()
    }

    fn drive(conn: &mut Conn<MockTransport>, readable: bool) -> Disposition {
        conn.ready(readable, false, Instant::now())
    }

    #[test]
    fn test_static_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), b"Hello World").unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut()
            .push_input(b"GET /hello.txt HTTP/1.1\r\nHost: x\r\n\r\n");
        let d = drive(&mut conn, true);

        let out = written(&mut conn);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Type: text/plain\r\n"));
        assert!(out.contains("Content-Length: 11\r\n"));
        assert!(out.contains("ETag: \""));
        assert!(out.ends_with("Hello World"));
        // Keep-alive: ready for the next request
        assert!(matches!(d, Disposition::Continue { .. }));
    }

    #[test]
    fn test_head_suppresses_body() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"12345").unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut()
            .push_input(b"HEAD /a.txt HTTP/1.1\r\n\r\n");
        drive(&mut conn, true);

        let out = written(&mut conn);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_range_request() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("r.txt"), b"0123456789").unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut()
            .push_input(b"GET /r.txt HTTP/1.1\r\nRange: bytes=2-5\r\n\r\n");
        drive(&mut conn, true);

        let out = written(&mut conn);
        assert!(out.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(out.contains("Content-Range: bytes 2-5/10\r\n"));
        assert!(out.contains("Content-Length: 4\r\n"));
        assert!(out.ends_with("2345"));
    }

    #[test]
    fn test_missing_document_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut()
            .push_input(b"GET /nope.txt HTTP/1.1\r\n\r\n");
        let d = drive(&mut conn, true);

        let out = written(&mut conn);
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.contains("404 Not Found</h1>"));
        // A failed request does not kill a keep-alive connection
        assert!(matches!(d, Disposition::Continue { .. }));
    }

    #[test]
    fn test_body_delivered_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut()
            .push_input(b"POST /echo HTTP/1.1\r\nContent-Length: 10\r\n\r\n12345");
        let d = drive(&mut conn, true);
        // Body incomplete: response not started yet
        assert!(written(&mut conn).is_empty());
        assert!(matches!(d, Disposition::Continue { .. }));

        conn.transport_mut().push_input(b"67890");
        drive(&mut conn, true);

        let out = written(&mut conn);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 10\r\n"));
        assert!(out.ends_with("1234567890"));
    }

    #[test]
    fn test_pipelined_requests_served_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"AA").unwrap();
        fs::write(dir.path().join("b.txt"), b"BB").unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut().push_input(
            b"GET /a.txt HTTP/1.1\r\n\r\nGET /b.txt HTTP/1.1\r\n\r\n",
        );
        let d = drive(&mut conn, true);

        let out = written(&mut conn);
        let first = out.find("AA").unwrap();
        let second = out.find("BB").unwrap();
        assert!(first < second);
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(matches!(d, Disposition::Continue { .. }));
    }

    #[test]
    fn test_partial_write_recovery() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big.txt"), b"abcdefghijklmnopqrstuvwxyz").unwrap();
        let mut conn = conn_for(dir.path());

        // Socket initially accepts nothing
        conn.transport_mut().write_cap = Some(0);
        conn.transport_mut()
            .push_input(b"GET /big.txt HTTP/1.1\r\n\r\n");
        let d = drive(&mut conn, true);
        assert!(written(&mut conn).is_empty());
        assert!(matches!(
            d,
            Disposition::Continue { writable: true, .. }
        ));

        // Then drains 7 bytes at a time
        conn.transport_mut().write_cap = Some(7);
        for _ in 0..40 {
            match conn.ready(false, true, Instant::now()) {
                Disposition::Continue { writable: true, .. } => continue,
                _ => break,
            }
        }

        let out = written(&mut conn);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("abcdefghijklmnopqrstuvwxyz"));
        // Exactly one header block: no byte was re-sent
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 1);
    }

    #[test]
    fn test_chunked_body_split_at_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut().push_input(
            b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel",
        );
        drive(&mut conn, true);
        assert!(written(&mut conn).is_empty());

        // Continuation splits inside the terminating boundary line
        conn.transport_mut().push_input(b"lo\r\n0\r");
        drive(&mut conn, true);
        assert!(written(&mut conn).is_empty());

        conn.transport_mut().push_input(b"\n\r\n");
        drive(&mut conn, true);

        let out = written(&mut conn);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("hello"));
    }

    #[test]
    fn test_malformed_chunk_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut().push_input(
            b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nbad",
        );
        let d = drive(&mut conn, true);
        assert_eq!(d, Disposition::Close);
        // Corrupt framing: nothing is sent
        assert!(written(&mut conn).is_empty());
    }

    #[test]
    fn test_malformed_request_line_is_400_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut().push_input(b"garbage\r\n\r\n");
        let d = drive(&mut conn, true);

        let out = written(&mut conn);
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert_eq!(d, Disposition::Close);
    }

    #[test]
    fn test_eof_mid_body_fails_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut()
            .push_input(b"POST /echo HTTP/1.1\r\nContent-Length: 10\r\n\r\n123");
        conn.transport_mut().close_input();
        let d = drive(&mut conn, true);

        assert_eq!(d, Disposition::Close);
        assert!(written(&mut conn).is_empty());
    }

    #[test]
    fn test_clean_eof_between_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut().close_input();
        let d = drive(&mut conn, true);
        assert_eq!(d, Disposition::Close);
        assert!(written(&mut conn).is_empty());
    }

    #[test]
    fn test_if_none_match_yields_304() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("c.txt"), b"cache me").unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut()
            .push_input(b"GET /c.txt HTTP/1.1\r\n\r\n");
        drive(&mut conn, true);
        let out = written(&mut conn);
        let etag_start = out.find("ETag: \"").unwrap() + 7;
        let etag_end = out[etag_start..].find('"').unwrap() + etag_start;
        let etag = out[etag_start..etag_end].to_string();

        let mut conn = conn_for(dir.path());
        conn.transport_mut().push_input(
            format!("GET /c.txt HTTP/1.1\r\nIf-None-Match: \"{etag}\"\r\n\r\n").as_bytes(),
        );
        drive(&mut conn, true);

        let out = written(&mut conn);
        assert!(out.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(!out.contains("cache me"));
    }

    #[test]
    fn test_unsatisfiable_range_is_416() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("s.txt"), b"short").unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut()
            .push_input(b"GET /s.txt HTTP/1.1\r\nRange: bytes=100-200\r\n\r\n");
        drive(&mut conn, true);

        let out = written(&mut conn);
        assert!(out.starts_with("HTTP/1.1 416 Range Not Satisfiable\r\n"));
        assert!(out.contains("Content-Range: bytes */5\r\n"));
    }

    #[test]
    fn test_handler_error_status_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut()
            .push_input(b"GET /busy HTTP/1.1\r\n\r\n");
        let d = drive(&mut conn, true);

        let out = written(&mut conn);
        assert!(out.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(out.contains("503 Service Unavailable</h1>"));
        // Request-scoped failure: the connection stays usable
        assert!(matches!(d, Disposition::Continue { .. }));
    }

    #[test]
    fn test_write_progress_extends_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join("big.bin"), &content).unwrap();
        let mut conn = conn_for(dir.path());
        let inactivity = Config::default().timeouts.inactivity;

        let mut now = Instant::now();
        conn.transport_mut().write_budget = Some(0);
        conn.transport_mut()
            .push_input(b"GET /big.bin HTTP/1.1\r\n\r\n");
        conn.ready(true, false, now);

        // Trickle 16 bytes per writable event, with events spaced just
        // inside the inactivity window. Each write makes progress, so
        // the deadline must keep moving ahead of the clock.
        for _ in 0..400 {
            now += inactivity - Duration::from_secs(1);
            conn.transport_mut().write_budget = Some(16);
            match conn.ready(false, true, now) {
                Disposition::Continue { writable: true, .. } => continue,
                Disposition::Continue { .. } => break,
                Disposition::Close => panic!("closed mid-transfer despite write progress"),
            }
        }

        let out = conn.transport_mut().written.clone();
        assert!(out.ends_with(&content));
    }

    #[test]
    fn test_no_read_interest_while_transmitting() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("slow.txt"), vec![b'z'; 1024]).unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut().write_cap = Some(0);
        conn.transport_mut()
            .push_input(b"GET /slow.txt HTTP/1.1\r\n\r\n");
        let d = drive(&mut conn, true);
        // Mid-transfer: write interest only, so a peer streaming
        // pipelined requests cannot grow the input buffer
        assert_eq!(
            d,
            Disposition::Continue {
                readable: false,
                writable: true
            }
        );

        conn.transport_mut().write_cap = None;
        let d = conn.ready(false, true, Instant::now());
        assert_eq!(
            d,
            Disposition::Continue {
                readable: true,
                writable: false
            }
        );
    }

    #[test]
    fn test_http10_close_delimited() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), b"ten bytes!").unwrap();
        let mut conn = conn_for(dir.path());

        conn.transport_mut()
            .push_input(b"GET /x.txt HTTP/1.0\r\n\r\n");
        let d = drive(&mut conn, true);

        let out = written(&mut conn);
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert_eq!(d, Disposition::Close);
    }
}
