//! Buffering HTTP/1.x reverse proxy.
//!
//! Clients are served by single-threaded, readiness-driven engines. Each
//! request is buffered in full, relayed to a backend over a fresh connection,
//! and the response is drained from the backend as fast as it is produced,
//! spilling to disk when the client reads slower than the backend writes.

pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use engine::{Engine, EngineSettings};
pub use error::ProxyError;
pub use lifecycle::Shutdown;
