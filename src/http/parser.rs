//! Incremental HTTP/1.x request parsing.
//!
//! The connection machine accumulates raw bytes until a full header
//! block (CRLFCRLF) is present, then hands the block here. Body framing
//! (content-length trimming, chunk boundaries) stays in the connection
//! machine and the chunk decoder.

use crate::config::Limits;
use crate::http::headers::HeaderMap;
use crate::http::request::{Method, RangeSpec, Request, Version};
use bytes::BytesMut;
use std::fmt;

/// Parse failures, each mapped to an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    BadRequestLine,
    BadHeader,
    UriTooLong,
    UnsupportedMethod,
    UnsupportedVersion,
    BadContentLength,
    BodyTooLarge,
}

impl ParseError {
    pub fn status(&self) -> u16 {
        match self {
            ParseError::BadRequestLine | ParseError::BadHeader | ParseError::BadContentLength => {
                400
            }
            ParseError::UriTooLong => 414,
            ParseError::UnsupportedMethod => 501,
            ParseError::UnsupportedVersion => 505,
            ParseError::BodyTooLarge => 413,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ParseError::BadRequestLine => "malformed request line",
            ParseError::BadHeader => "malformed header",
            ParseError::UriTooLong => "request URI too long",
            ParseError::UnsupportedMethod => "unsupported method",
            ParseError::UnsupportedVersion => "unsupported protocol version",
            ParseError::BadContentLength => "malformed content length",
            ParseError::BodyTooLarge => "request body too large",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ParseError {}

/// Find the end of the header block. Returns the offset one past the
/// terminating CRLFCRLF, or `None` if the block is still incomplete.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parse a complete header block (request line through the blank line)
/// into a `Request`.
pub fn parse_request(block: &[u8], limits: &Limits) -> Result<Request, ParseError> {
    let mut lines = split_crlf(block);

    let request_line = lines.next().ok_or(ParseError::BadRequestLine)?;
    let (method, uri, version) = parse_request_line(request_line, limits)?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::BadHeader)?;
        if colon == 0 {
            return Err(ParseError::BadHeader);
        }
        let name = std::str::from_utf8(&line[..colon]).map_err(|_| ParseError::BadHeader)?;
        let value = std::str::from_utf8(&line[colon + 1..])
            .map_err(|_| ParseError::BadHeader)?
            .trim();
        if name.trim() != name {
            // No whitespace allowed around the field name
            return Err(ParseError::BadHeader);
        }
        headers.append(name, value);
    }

    let content_length = match headers.get("Content-Length") {
        Some(v) => {
            let n: u64 = v.trim().parse().map_err(|_| ParseError::BadContentLength)?;
            if n > limits.max_body_size {
                return Err(ParseError::BodyTooLarge);
            }
            Some(n)
        }
        None => None,
    };

    let chunked = headers
        .get("Transfer-Encoding")
        .map_or(false, |v| v.eq_ignore_ascii_case("chunked"));
    if chunked && content_length.is_some() {
        // Conflicting framing corrupts body boundaries
        return Err(ParseError::BadContentLength);
    }

    let keep_alive = match headers.get("Connection") {
        Some(v) if v.eq_ignore_ascii_case("close") => false,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
        _ => version == Version::Http11,
    };

    let range = headers.get("Range").and_then(parse_range);

    let (path, query) = match uri.find('?') {
        Some(pos) => (uri[..pos].to_string(), Some(uri[pos + 1..].to_string())),
        None => (uri.clone(), None),
    };
    let path = percent_decode(&path);
    let extension = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());

    Ok(Request {
        method,
        uri,
        path,
        query,
        version,
        headers,
        content_length,
        chunked,
        range,
        keep_alive,
        extension,
        body: BytesMut::new(),
        body_complete: false,
        form: Vec::new(),
    })
}

fn parse_request_line(
    line: &[u8],
    limits: &Limits,
) -> Result<(Method, String, Version), ParseError> {
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());

    let method_bytes = parts.next().ok_or(ParseError::BadRequestLine)?;
    let uri_bytes = parts.next().ok_or(ParseError::BadRequestLine)?;
    let version_bytes = parts.next().ok_or(ParseError::BadRequestLine)?;
    if parts.next().is_some() {
        return Err(ParseError::BadRequestLine);
    }

    let method = Method::from_bytes(method_bytes).ok_or(ParseError::UnsupportedMethod)?;

    if uri_bytes.len() > limits.max_uri_size {
        return Err(ParseError::UriTooLong);
    }
    if uri_bytes.is_empty() || uri_bytes[0] != b'/' {
        // Absolute-form and authority-form URIs are not served here
        if uri_bytes != b"*" {
            return Err(ParseError::BadRequestLine);
        }
    }
    let uri = std::str::from_utf8(uri_bytes)
        .map_err(|_| ParseError::BadRequestLine)?
        .to_string();

    let version = match version_bytes {
        b"HTTP/1.1" => Version::Http11,
        b"HTTP/1.0" => Version::Http10,
        v if v.starts_with(b"HTTP/") => return Err(ParseError::UnsupportedVersion),
        _ => return Err(ParseError::BadRequestLine),
    };

    Ok((method, uri, version))
}

/// Parse a single-range `bytes=` header. Multi-range requests are not
/// supported and are ignored (served as a full response).
fn parse_range(value: &str) -> Option<RangeSpec> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let start = if start.is_empty() {
        None
    } else {
        Some(start.trim().parse::<u64>().ok()?)
    };
    let end = if end.is_empty() {
        None
    } else {
        Some(end.trim().parse::<u64>().ok()?)
    };
    if start.is_none() && end.is_none() {
        return None;
    }
    Some(RangeSpec { start, end })
}

/// Minimal percent-decoding for request paths. Invalid escapes pass
/// through untouched.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn split_crlf(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block.split(|&b| b == b'\n').map(|line| {
        if line.ends_with(b"\r") {
            &line[..line.len() - 1]
        } else {
            line
        }
    })
}
