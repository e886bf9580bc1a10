//! Packet: the unit of data moving through pipeline queues.
//!
//! A packet carries either buffered bytes (`content`) or a virtual
//! file-backed span (`content == None`, `count > 0`) that only the
//! sendfile-style connector can transmit. The optional `prefix` holds
//! framing bytes (chunk boundary lines) that precede the content on the
//! wire but never count toward queue byte accounting.

use bytes::BytesMut;

/// Packet type flags.
pub mod flags {
    /// Response header block.
    pub const HEADER: u8 = 0x01;
    /// Body data.
    pub const DATA: u8 = 0x02;
    /// End-of-stream marker (count is always 0).
    pub const END: u8 = 0x04;
    /// Data produced for a byte-range response.
    pub const RANGE: u8 = 0x08;
}

/// A unit of header or body bytes inside a queue.
#[derive(Debug, Default)]
pub struct Packet {
    /// Buffered bytes; `None` makes this a virtual (file-backed) span.
    pub content: Option<BytesMut>,
    /// Framing bytes emitted before the content (chunk boundaries).
    pub prefix: Option<BytesMut>,
    /// Logical byte length. Equals the buffered length for real
    /// packets; for virtual packets it is the file span length.
    pub count: usize,
    pub flags: u8,
}

impl Packet {
    /// Empty data packet with a pre-sized buffer. Capacity 0 yields a
    /// buffer-less packet.
    pub fn with_capacity(capacity: usize) -> Packet {
        Packet {
            content: if capacity > 0 {
                Some(BytesMut::with_capacity(capacity))
            } else {
                Some(BytesMut::new())
            },
            prefix: None,
            count: 0,
            flags: flags::DATA,
        }
    }

    /// Data packet holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Packet {
        Packet {
            content: Some(BytesMut::from(data)),
            prefix: None,
            count: data.len(),
            flags: flags::DATA,
        }
    }

    /// Data packet taking ownership of an existing buffer.
    pub fn from_buf(buf: BytesMut) -> Packet {
        let count = buf.len();
        Packet {
            content: Some(buf),
            prefix: None,
            count,
            flags: flags::DATA,
        }
    }

    /// Header packet wrapping a formatted header block.
    pub fn header(block: BytesMut) -> Packet {
        let count = block.len();
        Packet {
            content: Some(block),
            prefix: None,
            count,
            flags: flags::HEADER,
        }
    }

    /// Zero-length end-of-stream marker.
    pub fn end() -> Packet {
        Packet {
            content: None,
            prefix: None,
            count: 0,
            flags: flags::END,
        }
    }

    /// Virtual file-backed span of `len` bytes.
    pub fn file_span(len: usize) -> Packet {
        Packet {
            content: None,
            prefix: None,
            count: len,
            flags: flags::DATA,
        }
    }

    pub fn is_header(&self) -> bool {
        self.flags & flags::HEADER != 0
    }

    pub fn is_data(&self) -> bool {
        self.flags & flags::DATA != 0
    }

    pub fn is_end(&self) -> bool {
        self.flags & flags::END != 0
    }

    /// A file-backed span with no buffered bytes.
    pub fn is_virtual(&self) -> bool {
        self.content.is_none() && self.count > 0
    }

    /// Append bytes, growing the buffer and the logical count together.
    pub fn append(&mut self, data: &[u8]) {
        let buf = self.content.get_or_insert_with(BytesMut::new);
        buf.extend_from_slice(data);
        self.count += data.len();
    }

    /// Split off the tail beyond `at` bytes, leaving this packet as the
    /// head. Returns `None` (no-op) when the packet is too small to
    /// split. The prefix stays with the head; the END flag moves to the
    /// tail so the stream terminator is never emitted early.
    pub fn split_off(&mut self, at: usize) -> Option<Packet> {
        if at == 0 || at >= self.count {
            return None;
        }
        let tail_flags = self.flags & !flags::HEADER;
        let tail = match self.content {
            Some(ref mut buf) => Packet {
                content: Some(buf.split_off(at)),
                prefix: None,
                count: self.count - at,
                flags: tail_flags,
            },
            None => Packet {
                content: None,
                prefix: None,
                count: self.count - at,
                flags: tail_flags,
            },
        };
        self.count = at;
        self.flags &= !flags::END;
        Some(tail)
    }

    /// Bytes this packet contributes to an I/O vector (framing included).
    pub fn wire_len(&self) -> usize {
        let prefix = self.prefix.as_ref().map_or(0, |p| p.len());
        let content = self.content.as_ref().map_or(0, |c| c.len());
        prefix + content
    }
}
