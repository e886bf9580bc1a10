//! Static file handler: serves documents from the configured root.
//!
//! Supports conditional requests via a weak length+mtime ETag, a single
//! byte range per request, and HEAD. Plain full-file GETs emit one
//! file-backed span so the sendfile connector can transmit without
//! copying through user space; ranged and suppressed responses go
//! through buffered packets.

use crate::error::Result;
use crate::http::request::method_mask;
use crate::pipeline::packet::{flags, Packet};
use crate::pipeline::queue::QueueId;
use crate::pipeline::stage::{Stage, StageKind};
use crate::pipeline::Cx;
use crate::stages::put_end;
use std::fs::{File, Metadata};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

pub struct FileHandler {
    root: PathBuf,
}

impl FileHandler {
    pub fn new(root: PathBuf) -> FileHandler {
        FileHandler { root }
    }

    /// Map the request path onto the document root. Rejects any path
    /// that would escape the root.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = path.trim_start_matches('/');
        let candidate = Path::new(relative);
        for part in candidate.components() {
            match part {
                Component::Normal(_) => {}
                Component::CurDir => {}
                _ => return None,
            }
        }
        let mut full = self.root.join(candidate);
        if path.ends_with('/') || path.is_empty() {
            full.push("index.html");
        }
        Some(full)
    }
}

impl Stage for FileHandler {
    fn name(&self) -> &'static str {
        "file"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    fn methods(&self) -> u8 {
        method_mask::GET | method_mask::HEAD
    }

    fn run(&self, cx: &mut Cx<'_>, q: QueueId) -> Result<()> {
        let Some(mut path) = self.resolve(&cx.tx.req.path) else {
            cx.fail_request(403, "path escapes document root");
            return Ok(());
        };

        let (file, meta) = match open_document(&mut path) {
            Ok(pair) => pair,
            Err(e) => {
                let status = match e.kind() {
                    io::ErrorKind::NotFound => 404,
                    io::ErrorKind::PermissionDenied => 403,
                    _ => 500,
                };
                cx.fail_request(status, "document open failed");
                return Ok(());
            }
        };
        let len = meta.len();
        let etag = entity_tag(&meta);
        debug!(path = %path.display(), len, "serving document");

        let resp = &mut cx.tx.resp;
        resp.etag = Some(etag.clone());
        resp.content_type = Some(content_type(cx.tx.req.extension.as_deref()).to_string());

        if let Some(inm) = cx.tx.req.headers.get("If-None-Match") {
            if inm.trim_matches('"') == etag || inm == "*" {
                let resp = &mut cx.tx.resp;
                resp.status = 304;
                resp.content_type = None;
                resp.suppress_body = true;
                put_end(cx, q);
                return Ok(());
            }
        }

        let span = match cx.tx.req.range {
            Some(range) => match range.resolve(len) {
                Some((first, last)) => {
                    let resp = &mut cx.tx.resp;
                    resp.status = 206;
                    resp.content_range = Some((first, last, len));
                    Some((first, last))
                }
                None => {
                    cx.tx.resp
                        .headers
                        .set("Content-Range", &format!("bytes */{len}"));
                    cx.fail_request(416, "unsatisfiable range");
                    return Ok(());
                }
            },
            None => None,
        };
        let (first, last) = span.unwrap_or((0, len.saturating_sub(1)));
        let body_len = if len == 0 { 0 } else { last - first + 1 };
        cx.tx.resp.content_length = Some(body_len);

        if cx.tx.resp.suppress_body {
            put_end(cx, q);
            return Ok(());
        }

        if cx.tx.resp.uses_sendfile {
            cx.tx.resp.file = Some(file);
            cx.tx.resp.pos = first;
            if body_len > 0 {
                cx.put_for_service(q, Packet::file_span(body_len as usize), false);
            }
            put_end(cx, q);
            return Ok(());
        }

        let packet_size = cx.tx.net.queue(q).packet_size.max(1);
        let mut offset = first;
        let mut remaining = body_len;
        while remaining > 0 {
            let take = remaining.min(packet_size as u64) as usize;
            let mut buf = vec![0u8; take];
            if let Err(_e) = file.read_exact_at(&mut buf, offset) {
                cx.fail_request(500, "document read failed");
                return Ok(());
            }
            let mut packet = Packet::from_slice(&buf);
            if span.is_some() {
                packet.flags |= flags::RANGE;
            }
            cx.put_for_service(q, packet, false);
            offset += take as u64;
            remaining -= take as u64;
        }
        put_end(cx, q);
        Ok(())
    }
}

/// Open the document, following a directory to its index file.
fn open_document(path: &mut PathBuf) -> io::Result<(File, Metadata)> {
    let mut file = File::open(&path)?;
    let mut meta = file.metadata()?;
    if meta.is_dir() {
        path.push("index.html");
        file = File::open(&path)?;
        meta = file.metadata()?;
    }
    Ok((file, meta))
}

/// Weak validator from length and modification time.
fn entity_tag(meta: &Metadata) -> String {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    format!("{:x}-{:x}", meta.len(), mtime)
}

fn content_type(extension: Option<&str>) -> &'static str {
    match extension {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}
