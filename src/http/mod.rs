//! HTTP/1.x message handling.
//!
//! # Data Flow
//! ```text
//! client bytes
//!     → request.rs (incremental request head parser, framing, keepalive)
//!     → chunked.rs (chunked body decoder, trailers)
//!     → body.rs (memory or disk-backed request body)
//!
//! backend bytes
//!     → response.rs (response head parser, client-facing head)
//! ```
//!
//! # Design Decisions
//! - `httparse` is the tokenizer; everything here only buffers and frames
//! - Parsers own their input buffer so pipelined bytes survive dispatch
//! - Header names are normalized to lowercase via `http::HeaderName`

pub mod body;
pub mod chunked;
pub mod request;
pub mod response;

pub use body::RequestBody;
pub use chunked::ChunkedDecoder;
pub use request::{BodyFraming, RequestContext, RequestParser};
pub use response::ResponseHead;

use thiserror::Error;

/// Largest request or response head accepted before the parser gives up.
pub const MAX_HEAD_BYTES: usize = 112 * 1024;

/// Maximum number of header fields in one head.
pub const MAX_HEADERS: usize = 100;

/// Tokenizer-level failures.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,

    #[error("invalid header field: {0}")]
    InvalidHeader(String),

    #[error("invalid Content-Length")]
    InvalidContentLength,

    #[error("invalid chunk framing")]
    InvalidChunk,
}
