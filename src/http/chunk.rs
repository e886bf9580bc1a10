//! Incremental chunked-transfer decoder.
//!
//! Consumes body bytes from the connection's input buffer one event at
//! a time. A boundary line split across reads is left in the buffer and
//! reported as `NeedMore`; the caller retries once more bytes arrive.
//! Size lines are strict: an empty or non-hex line is fatal.

use bytes::{Buf, BytesMut};
use std::fmt;

/// Longest size line tolerated (hex digits plus extensions).
const MAX_SIZE_LINE: usize = 128;

/// One step of decode progress.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkEvent {
    /// A full boundary line is not yet buffered; wait for more input.
    NeedMore,
    /// A run of body bytes (possibly a partial chunk).
    Data(BytesMut),
    /// The zero-size terminator and trailing CRLF have been consumed.
    End,
}

/// Malformed chunk framing. Always fatal to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkError;

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("malformed chunk framing")
    }
}

impl std::error::Error for ChunkError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting a size line.
    Size,
    /// Consuming chunk data.
    Data { remaining: usize },
    /// Expecting the CRLF that closes a data chunk.
    DataEnd,
    /// After the zero-size chunk: discard trailer lines to the blank line.
    Trailer,
    Done,
}

/// Chunked-body decoder, one per request body.
#[derive(Debug)]
pub struct ChunkDecoder {
    state: State,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self { state: State::Size }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Advance the decoder, consuming from `input`.
    ///
    /// Returns one event per call; callers loop until `NeedMore` or `End`.
    pub fn decode(&mut self, input: &mut BytesMut) -> Result<ChunkEvent, ChunkError> {
        loop {
            match self.state {
                State::Size => {
                    let Some(line_end) = find_crlf(input) else {
                        if input.len() > MAX_SIZE_LINE {
                            return Err(ChunkError);
                        }
                        return Ok(ChunkEvent::NeedMore);
                    };
                    let size = parse_size(&input[..line_end])?;
                    input.advance(line_end + 2);
                    if size == 0 {
                        self.state = State::Trailer;
                    } else {
                        self.state = State::Data { remaining: size };
                    }
                }
                State::Data { remaining } => {
                    if input.is_empty() {
                        return Ok(ChunkEvent::NeedMore);
                    }
                    let take = remaining.min(input.len());
                    let data = input.split_to(take);
                    self.state = if take == remaining {
                        State::DataEnd
                    } else {
                        State::Data {
                            remaining: remaining - take,
                        }
                    };
                    return Ok(ChunkEvent::Data(data));
                }
                State::DataEnd => {
                    if input.len() < 2 {
                        return Ok(ChunkEvent::NeedMore);
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(ChunkError);
                    }
                    input.advance(2);
                    self.state = State::Size;
                }
                State::Trailer => {
                    let Some(line_end) = find_crlf(input) else {
                        if input.len() > MAX_SIZE_LINE {
                            return Err(ChunkError);
                        }
                        return Ok(ChunkEvent::NeedMore);
                    };
                    let blank = line_end == 0;
                    input.advance(line_end + 2);
                    if blank {
                        self.state = State::Done;
                        return Ok(ChunkEvent::End);
                    }
                    // Trailer headers are discarded
                }
                State::Done => return Ok(ChunkEvent::End),
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_size(line: &[u8]) -> Result<usize, ChunkError> {
    // Chunk extensions after ';' are ignored
    let digits = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    if digits.is_empty() {
        return Err(ChunkError);
    }
    let mut size: usize = 0;
    for &b in digits {
        let d = (b as char).to_digit(16).ok_or(ChunkError)?;
        size = size.checked_mul(16).ok_or(ChunkError)?;
        size = size.checked_add(d as usize).ok_or(ChunkError)?;
    }
    Ok(size)
}
