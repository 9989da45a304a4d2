//! Connection configuration with validation.

use crate::domain::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Default validator endpoint.
pub const DEFAULT_VALIDATOR_URL: &str = "tcp://localhost:4004";

/// Default upper bound for a single frame (10 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Default number of inbound handler invocations allowed to run at once.
pub const DEFAULT_INBOUND_CONCURRENCY: usize = 64;

/// Main connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Validator endpoint, `tcp://host:port` or `host:port`
    pub url: String,
    /// Timeout applied to calls that do not pass their own (None = wait forever)
    pub default_timeout_ms: Option<u64>,
    /// Largest frame accepted or sent, in bytes
    pub max_frame_len: usize,
    /// Inbound handler invocations in flight at once
    pub inbound_concurrency: usize,
    /// Reconnect backoff
    pub reconnect: ReconnectConfig,
    /// Memory of abandoned correlation ids
    pub retired_ids: RetiredIdsConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_VALIDATOR_URL.to_string(),
            default_timeout_ms: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            inbound_concurrency: DEFAULT_INBOUND_CONCURRENCY,
            reconnect: ReconnectConfig::default(),
            retired_ids: RetiredIdsConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Configuration for a specific validator url, defaults elsewhere.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `VALIDATOR_URL`: validator endpoint (default: tcp://localhost:4004)
    /// - `STREAM_REQUEST_TIMEOUT_MS`: default call timeout (default: none)
    /// - `STREAM_RECONNECT_INITIAL_MS`: first reconnect delay (default: 100)
    /// - `STREAM_RECONNECT_MAX_MS`: reconnect delay cap (default: 10000)
    /// - `STREAM_MAX_FRAME_LEN`: frame size limit in bytes (default: 10 MiB)
    /// - `STREAM_INBOUND_CONCURRENCY`: concurrent inbound handlers (default: 64)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            url: env::var("VALIDATOR_URL").unwrap_or(defaults.url),

            default_timeout_ms: env::var("STREAM_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(defaults.default_timeout_ms),

            max_frame_len: env::var("STREAM_MAX_FRAME_LEN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_frame_len),

            inbound_concurrency: env::var("STREAM_INBOUND_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.inbound_concurrency),

            reconnect: ReconnectConfig {
                initial_backoff_ms: env::var("STREAM_RECONNECT_INITIAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.reconnect.initial_backoff_ms),
                max_backoff_ms: env::var("STREAM_RECONNECT_MAX_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.reconnect.max_backoff_ms),
                ..defaults.reconnect
            },

            retired_ids: defaults.retired_ids,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::EmptyUrl);
        }

        if self.default_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidTimeout(
                "default_timeout_ms cannot be 0".into(),
            ));
        }

        if self.max_frame_len == 0 {
            return Err(ConfigError::InvalidLimit("max_frame_len cannot be 0".into()));
        }

        if self.inbound_concurrency == 0 {
            return Err(ConfigError::InvalidLimit(
                "inbound_concurrency cannot be 0".into(),
            ));
        }

        if self.retired_ids.capacity == 0 {
            return Err(ConfigError::InvalidLimit(
                "retired_ids.capacity cannot be 0".into(),
            ));
        }

        self.reconnect.validate()
    }

    /// Default call timeout, if any.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Capped exponential backoff between reconnect attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt
    pub initial_backoff_ms: u64,
    /// Upper bound for any delay
    pub max_backoff_ms: u64,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
    /// Spread delays uniformly over [delay/2, delay]
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::InvalidBackoff(
                "initial_backoff_ms cannot be 0".into(),
            ));
        }

        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::InvalidBackoff(format!(
                "max_backoff_ms ({}) is below initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            )));
        }

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoff(format!(
                "multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }

        Ok(())
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// How long answered or abandoned correlation ids are remembered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetiredIdsConfig {
    /// Time a retired id stays recognisable
    pub ttl_secs: u64,
    /// Maximum ids remembered at once (oldest evicted first)
    pub capacity: usize,
}

impl Default for RetiredIdsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            capacity: 65_536,
        }
    }
}

impl RetiredIdsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}
