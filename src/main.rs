//! spool-proxy
//!
//! A buffering reverse proxy for HTTP/1.x backends.
//!
//! # Architecture Overview
//!
//! ```text
//!                ┌──────────────────────── engine (one per worker) ────────────────────────┐
//!                │                                                                          │
//!   Client  ─────┼─▶ listener ─▶ client state machine ─▶ upstream state machine ───────────┼──▶ Backend
//!                │                      ▲                        │                         │
//!   Client  ◀────┼──────────────────────┴──── direct ◀───────────┤                         │
//!                │                      ▲                        ▼                         │
//!                │                      └──────────── streaming buffer (tempfile) ◀────────┼─── Backend
//!                │                                                                          │
//!                │  reactor (mio) · expiry policy · scratch pool                            │
//!                └──────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use spool_proxy::config::validation::validate_config;
use spool_proxy::config::{load_config, ConfigError, ProxyConfig};
use spool_proxy::lifecycle::{self, signals, Shutdown};
use spool_proxy::observability::{logging, metrics};

#[derive(Debug, Parser)]
#[command(name = "spool-proxy", version, about = "Buffering HTTP/1.x reverse proxy")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of engines (overrides engine.workers).
    #[arg(short, long)]
    workers: Option<usize>,

    /// Public listener address, repeatable (overrides listener.addresses).
    #[arg(short, long = "listen")]
    listen: Vec<String>,

    /// Backend address, repeatable (overrides engine.backends).
    #[arg(short, long = "backend")]
    backend: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.engine.workers = workers;
    }
    if !cli.listen.is_empty() {
        config.listener.addresses = cli.listen;
    }
    if !cli.backend.is_empty() {
        config.engine.backends = cli.backend;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "spool-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    let running = lifecycle::start(&config, &shutdown)?;
    for endpoint in &running.endpoints {
        tracing::info!(address = %endpoint, "Listening for connections");
    }

    let signal = signals::wait_for_shutdown().await?;
    tracing::info!(signal, "Shutdown signal received");
    shutdown.trigger();

    tokio::task::spawn_blocking(move || running.join()).await??;
    tracing::info!("Shutdown complete");
    Ok(())
}
