//! Bridge connection settings.
//!
//! Defaults match the worker's listener (`127.0.0.1:65535`). Any field can be
//! overridden from the environment with [`BridgeConfig::from_env`]:
//!
//! | Variable                             | Field           |
//! |--------------------------------------|-----------------|
//! | `INSIDIOUS_BRIDGE_HOST`              | `host`          |
//! | `INSIDIOUS_BRIDGE_PORT`              | `port`          |
//! | `INSIDIOUS_BRIDGE_CONNECT_ATTEMPTS`  | `max_attempts`  |
//! | `INSIDIOUS_BRIDGE_TIMEOUT_SECS`      | `request_timeout` |

use std::str::FromStr;
use std::time::Duration;

/// Default worker host (loopback).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default worker port.
pub const DEFAULT_PORT: u16 = 65535;

/// Default number of connection attempts.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Pause between connection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Bytes requested per socket read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

pub const HOST_ENV: &str = "INSIDIOUS_BRIDGE_HOST";
pub const PORT_ENV: &str = "INSIDIOUS_BRIDGE_PORT";
pub const ATTEMPTS_ENV: &str = "INSIDIOUS_BRIDGE_CONNECT_ATTEMPTS";
pub const TIMEOUT_ENV: &str = "INSIDIOUS_BRIDGE_TIMEOUT_SECS";

/// Settings for a [`BridgeClient`](crate::ipc::BridgeClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    /// Maximum number of connection attempts made by `connect()`.
    pub max_attempts: u32,
    pub retry_interval: Duration,
    /// Deadline for `request()`.
    pub request_timeout: Duration,
    pub read_chunk_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl BridgeConfig {
    /// Defaults overlaid with any `INSIDIOUS_BRIDGE_*` environment variables.
    ///
    /// Values that fail to parse are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup(HOST_ENV).filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = parse_var(&lookup, PORT_ENV) {
            config.port = port;
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, ATTEMPTS_ENV) {
            config.max_attempts = attempts.max(1);
        }
        if let Some(secs) = parse_var(&lookup, TIMEOUT_ENV) {
            config.request_timeout = Duration::from_secs(secs);
        }

        config
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// `host:port`, as passed to the socket connect call.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}
