//! Per-connection error taxonomy.
//!
//! Every error raised inside a connection step ends up as a `ProxyError` and is
//! handled at that connection's step boundary: the connection terminates and its
//! counterpart is notified. Descriptor exhaustion is the one condition that is
//! classified separately (see [`Acquire`]) so the expiry policy can intercept it.

use std::io;

use thiserror::Error;

use crate::http::ParseError;

/// Errors that terminate a single client or upstream connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed message: {0}")]
    Parse(#[from] ParseError),

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("partial 100-continue written before the client blocked")]
    ContinueAborted,

    #[error("upstream closed before sending a complete response head")]
    UpstreamClosed,

    #[error("connection deadline expired")]
    Expired,
}

/// Outcome of a descriptor-allocating call.
///
/// `Exhausted` is transient: the caller may free descriptors and retry.
#[derive(Debug)]
pub enum Acquire<T> {
    Acquired(T),
    Exhausted(io::Error),
    Fatal(io::Error),
}

impl<T> From<io::Result<T>> for Acquire<T> {
    fn from(result: io::Result<T>) -> Self {
        match result {
            Ok(value) => Acquire::Acquired(value),
            Err(e) if is_descriptor_exhaustion(&e) => Acquire::Exhausted(e),
            Err(e) => Acquire::Fatal(e),
        }
    }
}

/// EMFILE, ENFILE, ENOBUFS and ENOMEM all mean "free something and try again".
pub fn is_descriptor_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}
