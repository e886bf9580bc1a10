//! Parsed request record.
//!
//! Created by the connection machine once a full header block has been
//! buffered; lives until the response completes.

use crate::http::headers::HeaderMap;
use bytes::BytesMut;

/// Request method. Unrecognized methods are rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Option<Method> {
        match b {
            b"GET" => Some(Method::Get),
            b"HEAD" => Some(Method::Head),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"OPTIONS" => Some(Method::Options),
            b"TRACE" => Some(Method::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
        }
    }

    /// Capability bit used to match stages against request methods.
    pub fn mask(&self) -> u8 {
        match self {
            Method::Get => method_mask::GET,
            Method::Head => method_mask::HEAD,
            Method::Post => method_mask::POST,
            Method::Put => method_mask::PUT,
            Method::Delete => method_mask::DELETE,
            Method::Options => method_mask::OPTIONS,
            Method::Trace => method_mask::TRACE,
        }
    }
}

/// Method capability bits for stage templates.
pub mod method_mask {
    pub const GET: u8 = 0x01;
    pub const HEAD: u8 = 0x02;
    pub const POST: u8 = 0x04;
    pub const PUT: u8 = 0x08;
    pub const DELETE: u8 = 0x10;
    pub const OPTIONS: u8 = 0x20;
    pub const TRACE: u8 = 0x40;
    pub const ALL: u8 = 0x7f;
}

/// Protocol version. Anything else is rejected with 505.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// A single `Range: bytes=start-end` specification.
///
/// `start == None` means a suffix range (`bytes=-N`, last N bytes);
/// `end == None` means open-ended (`bytes=N-`). Both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl RangeSpec {
    /// Resolve against a resource of `len` bytes to concrete inclusive
    /// offsets. Returns `None` when the range is unsatisfiable.
    pub fn resolve(&self, len: u64) -> Option<(u64, u64)> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => {
                if s > e || s >= len {
                    None
                } else {
                    Some((s, e.min(len.saturating_sub(1))))
                }
            }
            (Some(s), None) => {
                if s >= len {
                    None
                } else {
                    Some((s, len - 1))
                }
            }
            (None, Some(n)) => {
                if n == 0 || len == 0 {
                    None
                } else {
                    Some((len.saturating_sub(n), len - 1))
                }
            }
            (None, None) => None,
        }
    }
}

/// Per-request parsed state.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Raw request-URI as received.
    pub uri: String,
    /// Decoded path component (no query string).
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
    /// Declared body length, if a Content-Length header was present.
    pub content_length: Option<u64>,
    /// Body uses chunked transfer encoding.
    pub chunked: bool,
    pub range: Option<RangeSpec>,
    /// Keep-alive negotiated from version + Connection header.
    pub keep_alive: bool,
    /// File extension computed from the path, lowercase.
    pub extension: Option<String>,
    /// Body bytes accumulated by the default handler ingress.
    pub body: BytesMut,
    /// Set when the terminating end-of-stream packet has been seen.
    pub body_complete: bool,
    /// Decoded form fields for urlencoded bodies.
    pub form: Vec<(String, String)>,
}

impl Request {
    /// True if the request declares body content the receive chain must
    /// be built for.
    pub fn has_body(&self) -> bool {
        self.chunked || self.content_length.map_or(false, |n| n > 0)
    }

    pub fn is_form(&self) -> bool {
        self.headers
            .get("Content-Type")
            .map_or(false, |ct| ct.starts_with("application/x-www-form-urlencoded"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_mask() {
        assert_eq!(Method::Get.mask(), method_mask::GET);
        assert_ne!(method_mask::ALL & Method::Trace.mask(), 0);
    }

    #[test]
    fn test_range_resolve() {
        let r = RangeSpec {
            start: Some(0),
            end: Some(4),
        };
        assert_eq!(r.resolve(20), Some((0, 4)));

        // End clamped to resource length
        let r = RangeSpec {
            start: Some(10),
            end: Some(99),
        };
        assert_eq!(r.resolve(20), Some((10, 19)));

        // Open-ended
        let r = RangeSpec {
            start: Some(5),
            end: None,
        };
        assert_eq!(r.resolve(20), Some((5, 19)));

        // Suffix
        let r = RangeSpec {
            start: None,
            end: Some(4),
        };
        assert_eq!(r.resolve(20), Some((16, 19)));

        // Unsatisfiable
        let r = RangeSpec {
            start: Some(30),
            end: None,
        };
        assert_eq!(r.resolve(20), None);
    }
}
