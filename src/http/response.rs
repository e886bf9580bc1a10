//! Per-request response record and header wire formatting.
//!
//! The response accumulates what the handler and filters decide (status,
//! length framing, entity metadata); the connector materializes the
//! header block exactly once, on first sight of output.

use crate::http::headers::HeaderMap;
use crate::http::request::Version;
use bytes::BytesMut;
use chrono::Utc;
use std::fs::File;

const SERVER_NAME: &str = concat!("emberweb/", env!("CARGO_PKG_VERSION"));

/// Per-request response state.
#[derive(Debug, Default)]
pub struct Response {
    pub status: u16,
    /// Handler-set custom headers, emitted after the fixed set.
    pub headers: HeaderMap,
    pub content_type: Option<String>,
    /// Definite body length, when known before headers are emitted.
    pub content_length: Option<u64>,
    /// Body uses chunked framing (set by the chunk filter).
    pub chunked: bool,
    pub etag: Option<String>,
    pub cache_control: Option<String>,
    /// (first, last, total) for a 206 response.
    pub content_range: Option<(u64, u64, u64)>,
    /// HTTP/1.0 body with unknown length: the close delimits the body.
    pub close_delimited: bool,
    /// Emit headers only; body packets are discarded by the connector.
    pub suppress_body: bool,
    pub headers_emitted: bool,
    /// Total bytes put on the wire for this response, framing included.
    pub bytes_written: u64,
    /// File read offset for the sendfile path; advanced on partial sends.
    pub pos: u64,
    /// Open file backing virtual packets (sendfile path).
    pub file: Option<File>,
    /// The sendfile-style connector was selected for this request.
    pub uses_sendfile: bool,
    /// First failure recorded for this request, if any.
    pub error: Option<u16>,
}

impl Response {
    pub fn new() -> Self {
        Response {
            status: 200,
            ..Default::default()
        }
    }

    /// Format the full header block per the wire contract: status line,
    /// Date, Server, entity metadata, length framing, connection
    /// disposition, then custom headers and the blank line. For a
    /// chunked body the final CRLF is omitted; the first chunk
    /// boundary's leading CRLF completes the block.
    ///
    /// `keep_alive` carries the advertisement (timeout secs, requests
    /// remaining); `None` means the connection closes after this
    /// response.
    pub fn format_headers(
        &mut self,
        version: Version,
        keep_alive: Option<(u64, u32)>,
    ) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);
        let reason = status_reason(self.status);
        out.extend_from_slice(
            format!("{} {} {}\r\n", version.as_str(), self.status, reason).as_bytes(),
        );

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
        out.extend_from_slice(format!("Date: {date}\r\n").as_bytes());
        out.extend_from_slice(format!("Server: {SERVER_NAME}\r\n").as_bytes());

        if let Some(ref cc) = self.cache_control {
            out.extend_from_slice(format!("Cache-Control: {cc}\r\n").as_bytes());
        }
        if let Some(ref etag) = self.etag {
            out.extend_from_slice(format!("ETag: \"{etag}\"\r\n").as_bytes());
        }
        if let Some(ref ct) = self.content_type {
            out.extend_from_slice(format!("Content-Type: {ct}\r\n").as_bytes());
        }
        if let Some((first, last, total)) = self.content_range {
            out.extend_from_slice(
                format!("Content-Range: bytes {first}-{last}/{total}\r\n").as_bytes(),
            );
        }

        if self.chunked {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        } else if let Some(len) = self.content_length {
            out.extend_from_slice(format!("Content-Length: {len}\r\n").as_bytes());
        }

        match keep_alive {
            Some((timeout, max)) if !self.close_delimited => {
                out.extend_from_slice(b"Connection: keep-alive\r\n");
                out.extend_from_slice(
                    format!("Keep-Alive: timeout={timeout}, max={max}\r\n").as_bytes(),
                );
            }
            _ => {
                out.extend_from_slice(b"Connection: close\r\n");
            }
        }

        for (name, value) in self.headers.iter() {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.chunked {
            out.extend_from_slice(b"\r\n");
        }

        self.headers_emitted = true;
        out
    }

    /// Minimal HTML body for a failed request.
    pub fn error_body(status: u16) -> BytesMut {
        let reason = status_reason(status);
        let mut out = BytesMut::new();
        out.extend_from_slice(
            format!(
                "<!DOCTYPE html>\r\n<html><head><title>{status} {reason}</title></head>\
                 <body><h1>{status} {reason}</h1></body></html>\r\n"
            )
            .as_bytes(),
        );
        out
    }
}

/// Reason phrase for a status code.
pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        416 => "Range Not Satisfiable",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_block_content_length() {
        let mut resp = Response::new();
        resp.content_length = Some(11);
        resp.content_type = Some("text/plain".to_string());

        let block = resp.format_headers(Version::Http11, Some((5, 99)));
        let text = std::str::from_utf8(&block).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.contains("Server: emberweb/"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(!text.contains("Transfer-Encoding"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Keep-Alive: timeout=5, max=99\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(resp.headers_emitted);
    }

    #[test]
    fn test_header_block_chunked() {
        let mut resp = Response::new();
        resp.chunked = true;

        let block = resp.format_headers(Version::Http11, None);
        let text = std::str::from_utf8(&block).unwrap();

        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.contains("Connection: close\r\n"));
        // The first boundary line supplies the terminating blank line
        assert!(text.ends_with("\r\n"));
        assert!(!text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_header_block_range() {
        let mut resp = Response::new();
        resp.status = 206;
        resp.content_range = Some((0, 4, 20));
        resp.content_length = Some(5);

        let block = resp.format_headers(Version::Http11, None);
        let text = std::str::from_utf8(&block).unwrap();

        assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(text.contains("Content-Range: bytes 0-4/20\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
    }

    #[test]
    fn test_custom_headers_after_fixed_set() {
        let mut resp = Response::new();
        resp.content_length = Some(0);
        resp.headers.append("X-Custom", "yes");

        let block = resp.format_headers(Version::Http11, None);
        let text = std::str::from_utf8(&block).unwrap();

        let custom = text.find("X-Custom: yes\r\n").unwrap();
        let conn = text.find("Connection:").unwrap();
        assert!(custom > conn);
    }

    #[test]
    fn test_error_body() {
        let body = Response::error_body(404);
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("404 Not Found"));
    }
}
