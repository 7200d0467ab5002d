//! Startup orchestration.
//!
//! # Responsibilities
//! - Convert the validated configuration into engine settings
//! - Bind every public listener (blocking std sockets, once)
//! - Spawn one engine thread per worker, each with its own listener clones
//!
//! # Design Decisions
//! - Fail fast: any bind error is fatal
//! - Listeners are bound before the first engine starts accepting

use std::io;
use std::thread::JoinHandle;

use thiserror::Error;

use crate::config::{ConfigError, ProxyConfig, ValidationError};
use crate::engine::{Engine, EngineSettings};
use crate::lifecycle::Shutdown;
use crate::net::{BoundListener, Endpoint};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {address}: {source}")]
    Bind { address: String, source: io::Error },

    #[error("engine error: {0}")]
    Engine(#[from] io::Error),

    #[error("engine thread panicked")]
    Panicked,
}

/// Engines started by [`start`].
#[derive(Debug)]
pub struct Running {
    /// Addresses actually bound (port 0 resolved).
    pub endpoints: Vec<Endpoint>,
    engines: Vec<JoinHandle<io::Result<()>>>,
}

impl Running {
    /// Waits for every engine to exit, reporting the first failure.
    pub fn join(self) -> Result<(), StartupError> {
        let mut outcome = Ok(());
        for engine in self.engines {
            let result = match engine.join() {
                Ok(result) => result.map_err(StartupError::Engine),
                Err(_) => Err(StartupError::Panicked),
            };
            if let Err(e) = result {
                tracing::error!(error = %e, "Engine exited with error");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}

/// Binds the configured listeners and starts `engine.workers` engines.
pub fn start(config: &ProxyConfig, shutdown: &Shutdown) -> Result<Running, StartupError> {
    let settings = EngineSettings::from_config(config)?;

    let mut bound = Vec::with_capacity(config.listener.addresses.len());
    for address in &config.listener.addresses {
        let endpoint: Endpoint = address.parse().map_err(|_| {
            ConfigError::Validation(vec![ValidationError::BadAddress {
                field: "listener.addresses",
                value: address.clone(),
            }])
        })?;
        let listener = BoundListener::bind(&endpoint).map_err(|source| StartupError::Bind {
            address: address.clone(),
            source,
        })?;
        bound.push(listener);
    }
    let endpoints = bound
        .iter()
        .map(BoundListener::local_endpoint)
        .collect::<io::Result<Vec<_>>>()?;

    let workers = config.engine.workers.max(1);
    let mut engines = Vec::with_capacity(workers);
    for worker in 0..workers {
        let listeners = bound
            .iter()
            .map(BoundListener::to_listener)
            .collect::<io::Result<Vec<_>>>()?;
        engines.push(Engine::spawn(
            format!("engine-{worker}"),
            settings.clone(),
            listeners,
            shutdown.clone(),
        )?);
    }

    if let Some(backend) = settings.backends.first() {
        tracing::info!(workers, backend = %backend, "Engines started");
    }
    Ok(Running { endpoints, engines })
}
