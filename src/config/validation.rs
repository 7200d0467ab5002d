//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every listener and backend address parses
//! - Validate value ranges (timeouts > 0, workers > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::net::Endpoint;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.addresses must not be empty")]
    NoListeners,

    #[error("engine.backends must not be empty")]
    NoBackends,

    #[error("{field}: invalid address {value:?}")]
    BadAddress { field: &'static str, value: String },

    #[error("engine.workers must be at least 1")]
    NoWorkers,

    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("engine.client_body_buffer_size ({buffer}) exceeds engine.client_max_body_size ({max})")]
    BufferAboveMax { buffer: u64, max: u64 },
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.addresses.is_empty() {
        errors.push(ValidationError::NoListeners);
    }
    for value in &config.listener.addresses {
        if value.parse::<Endpoint>().is_err() {
            errors.push(ValidationError::BadAddress {
                field: "listener.addresses",
                value: value.clone(),
            });
        }
    }

    if config.engine.backends.is_empty() {
        errors.push(ValidationError::NoBackends);
    }
    for value in &config.engine.backends {
        if value.parse::<Endpoint>().is_err() {
            errors.push(ValidationError::BadAddress {
                field: "engine.backends",
                value: value.clone(),
            });
        }
    }

    if config.engine.workers == 0 {
        errors.push(ValidationError::NoWorkers);
    }

    let max = config.engine.client_max_body_size;
    let buffer = config.engine.client_body_buffer_size;
    if max > 0 && buffer > max {
        errors.push(ValidationError::BufferAboveMax { buffer, max });
    }

    let t = &config.timeouts;
    for (name, secs) in [
        ("keepalive_secs", t.keepalive_secs),
        ("client_header_secs", t.client_header_secs),
        ("client_body_secs", t.client_body_secs),
        ("client_send_secs", t.client_send_secs),
        ("proxy_read_secs", t.proxy_read_secs),
        ("proxy_send_secs", t.proxy_send_secs),
    ] {
        if secs == 0 {
            errors.push(ValidationError::ZeroTimeout(name));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
