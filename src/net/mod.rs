//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Configured address ("host:port" or "unix:/path")
//!     → endpoint.rs (parse once at startup)
//!     → listener.rs (bind public listeners, clone per engine)
//!     → stream.rs (non-blocking TCP/Unix streams, zero-copy file send)
//!     → connection.rs (connection identifiers for tracing)
//! ```
//!
//! # Design Decisions
//! - TCP and Unix-domain sockets share one enum so the engine is transport-blind
//! - Listeners are bound once and cloned into every engine
//! - Nothing here blocks; would-block surfaces as `io::ErrorKind::WouldBlock`

pub mod connection;
pub mod endpoint;
pub mod listener;
pub mod stream;

pub use connection::{ConnectionId, ConnectionIds};
pub use endpoint::Endpoint;
pub use listener::{BoundListener, Listener};
pub use stream::Stream;
