//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Public listeners.
    pub listener: ListenerConfig,

    /// Connection engine settings (backends, workers, body buffering).
    pub engine: EngineConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Addresses to accept clients on ("0.0.0.0:8080" or "unix:/path").
    pub addresses: Vec<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["0.0.0.0:8080".to_string()],
        }
    }
}

/// Readiness primitive used by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReactorKind {
    /// The platform's best poller (epoll, kqueue) through mio.
    #[default]
    Poll,
}

impl ReactorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactorKind::Poll => "poll",
        }
    }
}

/// Connection engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend addresses; requests always go to the first one.
    pub backends: Vec<String>,

    /// Number of independent engines (one reactor thread each).
    pub workers: usize,

    /// Readiness primitive.
    pub reactor: ReactorKind,

    /// Largest accepted request body in bytes (0 = unlimited).
    pub client_max_body_size: u64,

    /// Request bodies of at least this many bytes are spooled to disk.
    pub client_body_buffer_size: u64,

    /// Interest-set size that triggers an expiry pass (0 = half of RLIMIT_NOFILE).
    pub keepalive_expiry_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backends: vec!["127.0.0.1:3000".to_string()],
            workers: 1,
            reactor: ReactorKind::Poll,
            client_max_body_size: 1024 * 1024,
            client_body_buffer_size: 112 * 1024,
            keepalive_expiry_threshold: 0,
        }
    }
}

/// Timeout configuration, in seconds. Defaults match nginx.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Idle persistent connection between requests.
    pub keepalive_secs: u64,

    /// Reading a request head.
    pub client_header_secs: u64,

    /// Reading a request body.
    pub client_body_secs: u64,

    /// Writing a response to a blocked client.
    pub client_send_secs: u64,

    /// Waiting on the backend for response bytes.
    pub proxy_read_secs: u64,

    /// Connecting and writing the request to the backend.
    pub proxy_send_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: 75,
            client_header_secs: 60,
            client_body_secs: 60,
            client_send_secs: 60,
            proxy_read_secs: 60,
            proxy_send_secs: 60,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
