//! HTTP wire types: headers, request/response records, and the
//! incremental parsers feeding the connection state machine.

pub mod chunk;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;

pub use chunk::{ChunkDecoder, ChunkError, ChunkEvent};
pub use headers::HeaderMap;
pub use parser::{find_header_end, parse_request, ParseError};
pub use request::{Method, RangeSpec, Request, Version};
pub use response::Response;
