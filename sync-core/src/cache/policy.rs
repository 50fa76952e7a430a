//! Per-namespace cache policies.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How entries in one namespace are cached, debounced and evicted.
///
/// Durations are stored as milliseconds so policies can be written directly
/// in the TOML configuration (`[cache.<namespace>]` tables).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Lifetime of a committed entry (default: 5 minutes).
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Distance from the entry's geo-anchor beyond which it is treated as
    /// absent (default: 1000 m). Only used when `location_based`.
    #[serde(default = "default_location_threshold_meters")]
    pub location_threshold_meters: f64,
    /// Window after an issued request during which repeats are redirected to
    /// cache / pending state or suppressed (default: 1 second).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Upper bound on the total number of cached entries enforced when
    /// committing into this namespace (default: 100).
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Whether entries are anchored to the caller's location (default: false).
    #[serde(default)]
    pub location_based: bool,
}

fn default_ttl_ms() -> u64 {
    5 * 60 * 1000 // 5 minutes
}

fn default_location_threshold_meters() -> f64 {
    1000.0
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_max_entries() -> usize {
    100
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            location_threshold_meters: default_location_threshold_meters(),
            debounce_ms: default_debounce_ms(),
            max_entries: default_max_entries(),
            location_based: false,
        }
    }
}

impl CachePolicy {
    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Debounce window.
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Set the entry lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = duration_millis(ttl);
        self
    }

    /// Set the debounce window.
    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce_ms = duration_millis(window);
        self
    }

    /// Set the entry limit.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Anchor entries to the caller's location, invalidating them beyond `threshold_meters`.
    pub fn location_based(mut self, threshold_meters: f64) -> Self {
        self.location_based = true;
        self.location_threshold_meters = threshold_meters;
        self
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
