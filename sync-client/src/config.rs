//! Configuration loading for sync-client.
//!
//! Configuration is loaded from a TOML file with a `[realtime]` section for
//! the subscription manager and one `[cache.<namespace>]` table per cache
//! namespace.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tidal_sync_core::CachePolicy;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Subscription manager configuration.
    #[serde(default)]
    pub realtime: RealtimeConfig,
    /// Cache policies keyed by namespace.
    #[serde(default)]
    pub cache: HashMap<String, CachePolicy>,
}

/// Subscription manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Time allowed for the transport to confirm a subscription (default: 10s).
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// First reconnect delay (default: 1s).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Reconnect delay cap (default: 30s).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Reconnects attempted before giving up (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Keep-alive interval while connected (default: 30s).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How often idle subscriptions are looked for (default: 60s).
    #[serde(default = "default_idle_sweep_interval_ms")]
    pub idle_sweep_interval_ms: u64,
    /// Subscriptions idle longer than this are torn down (default: 5 minutes).
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
    /// Fallback poll interval while not connected (default: 15s).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

// Default value functions
fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_idle_sweep_interval_ms() -> u64 {
    60_000
}

fn default_max_idle_ms() -> u64 {
    5 * 60 * 1000 // 5 minutes
}

fn default_poll_interval_ms() -> u64 {
    15_000
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            idle_sweep_interval_ms: default_idle_sweep_interval_ms(),
            max_idle_ms: default_max_idle_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl RealtimeConfig {
    /// Connection timeout guard.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// First reconnect delay.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Reconnect delay cap.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Idle sweep interval.
    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_interval_ms)
    }

    /// Idle limit per subscription.
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    /// Fallback poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
