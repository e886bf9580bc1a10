//! Engine error types.
//!
//! Stage callbacks and the connection machine return `EngineError`;
//! most variants are terminal for the connection, while `Request`
//! failures are answered with an error response when headers have not
//! yet been flushed.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug)]
pub enum EngineError {
    /// Socket or file I/O failed.
    Io(io::Error),
    /// The peer closed the connection mid-exchange.
    PeerClosed,
    /// A request-scoped failure with the HTTP status to answer with.
    Request { status: u16, reason: String },
}

impl EngineError {
    pub fn request(status: u16, reason: impl Into<String>) -> EngineError {
        EngineError::Request {
            status,
            reason: reason.into(),
        }
    }

    /// Classify an I/O error: disconnect-shaped errors become
    /// `PeerClosed`, everything else stays `Io`.
    pub fn from_io(e: io::Error) -> EngineError {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => EngineError::PeerClosed,
            _ => EngineError::Io(e),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Io(e) => write!(f, "I/O error: {e}"),
            EngineError::PeerClosed => f.write_str("peer closed the connection"),
            EngineError::Request { status, reason } => {
                write!(f, "request failed ({status}): {reason}")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> EngineError {
        EngineError::from_io(e)
    }
}
