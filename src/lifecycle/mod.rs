//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → Bind public listeners → Spawn one engine per worker
//!
//! Shutdown (shutdown.rs):
//!     trigger() → Engines stop accepting → Idle connections reclaimed
//!     → In-flight responses finish → Engine threads exit
//!
//! Signals (signals.rs):
//!     SIGINT/SIGTERM/SIGQUIT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: every listener is bound before any engine runs
//! - Engines share only the listener sockets and the shutdown flag
//! - Signals are caught on the tokio runtime; engines never touch it

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{start, Running, StartupError};
