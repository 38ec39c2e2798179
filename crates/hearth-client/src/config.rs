//! Client configuration.
//!
//! All durations are milliseconds so the struct maps one-to-one onto TOML:
//!
//! ```toml
//! request_timeout_ms = 30000
//! heartbeat_interval_ms = 15000
//!
//! [backoff]
//! initial_ms = 800
//! max_ms = 15000
//! ```

use hearth_core::DEFAULT_PROMOTION_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Reconnection backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    /// Multiplier applied per failed attempt.
    pub factor: f64,
    /// Ceiling for the un-jittered delay.
    pub max_ms: u64,
    /// Fraction of the delay that is randomized, `0.0..=1.0`.
    pub jitter: f64,
    /// Give up after this many consecutive failures. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 800,
            factor: 1.7,
            max_ms: 15_000,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub request_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub backoff: BackoffConfig,
    /// Leader heartbeat cadence. The server's advertised tick interval wins.
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeat cycles before a follower promotes itself.
    pub promotion_threshold: u32,
    /// Event name that carries leader heartbeats.
    pub heartbeat_event: String,
    /// Event name that carries presence updates.
    pub presence_event: String,
    /// Largest accepted forward step of a state version counter.
    pub version_gap_tolerance: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            handshake_timeout_ms: 10_000,
            auto_reconnect: true,
            backoff: BackoffConfig::default(),
            heartbeat_interval_ms: 30_000,
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
            heartbeat_event: "heartbeat".to_string(),
            presence_event: "presence".to_string(),
            version_gap_tolerance: 1,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
