//! Connection identifiers.
//!
//! Every client and upstream connection is keyed by the `mio::Token` it is
//! registered under; `ConnectionId` is the same number with a stable,
//! human-readable form for structured logs.

use mio::Token;

/// Unique identifier for a connection within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub fn token(&self) -> Token {
        Token(self.0)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Hands out tokens above the range reserved for listeners and the waker.
#[derive(Debug)]
pub struct ConnectionIds {
    next: usize,
}

impl ConnectionIds {
    pub fn starting_at(first: usize) -> Self {
        Self { next: first }
    }

    /// Generate a new unique connection ID. IDs are never reused.
    pub fn next_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next);
        self.next += 1;
        id
    }
}
