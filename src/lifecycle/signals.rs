//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGINT, SIGTERM, SIGQUIT)
//! - Resolve once the first of them arrives
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - All three mean graceful shutdown; a second signal is not special

use std::io;

use tokio::signal::unix::{signal, SignalKind};

/// Waits for the first shutdown signal and returns its name.
pub async fn wait_for_shutdown() -> io::Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = quit.recv() => Ok("SIGQUIT"),
    }
}
