//! Engine configuration
//!
//! Plain values consumed by the dispatcher and the connection it drives.
//! Nothing here is reconfigurable at runtime.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use kiln_client::ConnectionConfig;
use kiln_core::MAX_BATCH_SIZE;
use kiln_core::wire::DEFAULT_BACKEND_ADDR;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend endpoint, `host:port`
    pub backend_addr: String,

    /// How long a submitted job may stay unacknowledged before it is
    /// resubmitted or failed
    pub submit_timeout: Duration,

    /// Longest a `send` may wait for room in the local queue
    pub send_timeout: Duration,

    /// Largest batch `submit_batch` accepts (never above 20)
    pub max_batch_size: usize,

    /// Dispatch attempts per job before it fails with "no-ack"
    pub max_attempts: u32,

    /// Responses drained per tick
    pub drain_cap: usize,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(backend_addr: impl Into<String>) -> Self {
        Self {
            backend_addr: backend_addr.into(),
            submit_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_millis(50),
            max_batch_size: MAX_BATCH_SIZE,
            max_attempts: 2,
            drain_cap: 64,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Every variable is optional:
    /// - KILN_BACKEND_ADDR (default: 127.0.0.1:5555)
    /// - KILN_SUBMIT_TIMEOUT_MS (default: 5000)
    /// - KILN_SEND_TIMEOUT_MS (default: 50)
    /// - KILN_MAX_BATCH_SIZE (default: 20)
    /// - KILN_MAX_ATTEMPTS (default: 2)
    /// - KILN_DRAIN_CAP (default: 64)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any key lookup, applying defaults for
    /// missing keys
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::new(DEFAULT_BACKEND_ADDR);

        let backend_addr = lookup("KILN_BACKEND_ADDR").unwrap_or(defaults.backend_addr);

        let submit_timeout = parse_var::<u64>(&lookup, "KILN_SUBMIT_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.submit_timeout);

        let send_timeout = parse_var::<u64>(&lookup, "KILN_SEND_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.send_timeout);

        let max_batch_size =
            parse_var(&lookup, "KILN_MAX_BATCH_SIZE")?.unwrap_or(defaults.max_batch_size);

        let max_attempts = parse_var(&lookup, "KILN_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts);

        let drain_cap = parse_var(&lookup, "KILN_DRAIN_CAP")?.unwrap_or(defaults.drain_cap);

        Ok(Self {
            backend_addr,
            submit_timeout,
            send_timeout,
            max_batch_size,
            max_attempts,
            drain_cap,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend_addr.is_empty() {
            anyhow::bail!("backend_addr cannot be empty");
        }

        if !self.backend_addr.contains(':') {
            anyhow::bail!("backend_addr must be in host:port form");
        }

        if self.submit_timeout.is_zero() {
            anyhow::bail!("submit_timeout must be greater than 0");
        }

        if self.send_timeout.is_zero() {
            anyhow::bail!("send_timeout must be greater than 0");
        }

        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE {
            anyhow::bail!("max_batch_size must be between 1 and {MAX_BATCH_SIZE}");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }

        if self.drain_cap == 0 {
            anyhow::bail!("drain_cap must be greater than 0");
        }

        Ok(())
    }

    /// Transport settings for the backend session
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            send_timeout: self.send_timeout,
            ..ConnectionConfig::new(self.backend_addr.clone())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_BACKEND_ADDR)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("{key} has invalid value {value:?}"))
        })
        .transpose()
}
