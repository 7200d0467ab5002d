//! Runtime form of the configuration, owned by each engine.

use std::time::Duration;

use crate::config::{ConfigError, ProxyConfig, ReactorKind, ValidationError};
use crate::net::Endpoint;

/// Why a connection is waiting; selects the timeout for its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Keepalive,
    ClientHeader,
    ClientBody,
    ClientSend,
    ProxyRead,
    ProxySend,
}

impl WaitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitReason::Keepalive => "keepalive",
            WaitReason::ClientHeader => "client_header",
            WaitReason::ClientBody => "client_body",
            WaitReason::ClientSend => "client_send",
            WaitReason::ProxyRead => "proxy_read",
            WaitReason::ProxySend => "proxy_send",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub keepalive: Duration,
    pub client_header: Duration,
    pub client_body: Duration,
    pub client_send: Duration,
    pub proxy_read: Duration,
    pub proxy_send: Duration,
}

impl Timeouts {
    pub fn for_reason(&self, reason: WaitReason) -> Duration {
        match reason {
            WaitReason::Keepalive => self.keepalive,
            WaitReason::ClientHeader => self.client_header,
            WaitReason::ClientBody => self.client_body,
            WaitReason::ClientSend => self.client_send,
            WaitReason::ProxyRead => self.proxy_read,
            WaitReason::ProxySend => self.proxy_send,
        }
    }

    /// Upper bound on one blocking poll.
    pub fn smallest(&self) -> Duration {
        [
            self.keepalive,
            self.client_header,
            self.client_body,
            self.client_send,
            self.proxy_read,
            self.proxy_send,
        ]
        .into_iter()
        .min()
        .unwrap_or(Duration::from_secs(1))
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(75),
            client_header: Duration::from_secs(60),
            client_body: Duration::from_secs(60),
            client_send: Duration::from_secs(60),
            proxy_read: Duration::from_secs(60),
            proxy_send: Duration::from_secs(60),
        }
    }
}

/// Everything a single engine needs to run.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub backends: Vec<Endpoint>,
    pub reactor: ReactorKind,
    pub client_max_body_size: u64,
    pub client_body_buffer_size: u64,
    /// `None` derives the threshold from RLIMIT_NOFILE.
    pub keepalive_expiry_threshold: Option<usize>,
    pub timeouts: Timeouts,
}

impl EngineSettings {
    pub fn new(backends: Vec<Endpoint>) -> Self {
        Self {
            backends,
            reactor: ReactorKind::Poll,
            client_max_body_size: 1024 * 1024,
            client_body_buffer_size: 112 * 1024,
            keepalive_expiry_threshold: None,
            timeouts: Timeouts::default(),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self, ConfigError> {
        let mut backends = Vec::with_capacity(config.engine.backends.len());
        for value in &config.engine.backends {
            let endpoint = value.parse::<Endpoint>().map_err(|_| {
                ConfigError::Validation(vec![ValidationError::BadAddress {
                    field: "engine.backends",
                    value: value.clone(),
                }])
            })?;
            backends.push(endpoint);
        }
        if backends.is_empty() {
            return Err(ConfigError::Validation(vec![ValidationError::NoBackends]));
        }

        let t = &config.timeouts;
        Ok(Self {
            backends,
            reactor: config.engine.reactor,
            client_max_body_size: config.engine.client_max_body_size,
            client_body_buffer_size: config.engine.client_body_buffer_size,
            keepalive_expiry_threshold: match config.engine.keepalive_expiry_threshold {
                0 => None,
                n => Some(n),
            },
            timeouts: Timeouts {
                keepalive: Duration::from_secs(t.keepalive_secs),
                client_header: Duration::from_secs(t.client_header_secs),
                client_body: Duration::from_secs(t.client_body_secs),
                client_send: Duration::from_secs(t.client_send_secs),
                proxy_read: Duration::from_secs(t.proxy_read_secs),
                proxy_send: Duration::from_secs(t.proxy_send_secs),
            },
        })
    }

    /// Interest-set size at which an opportunistic expiry pass runs.
    pub fn expiry_threshold(&self) -> usize {
        self.keepalive_expiry_threshold
            .unwrap_or_else(|| descriptor_limit() / 2)
            .max(1)
    }
}

/// Soft RLIMIT_NOFILE of this process.
pub fn descriptor_limit() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we pass.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
        return 1024;
    }
    limit.rlim_cur as usize
}
