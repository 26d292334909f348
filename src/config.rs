//! Configuration Module
//!
//! Handles loading cache configuration from environment variables.

use std::env;
use std::time::Duration;

/// Request cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Freshness window of a cache entry in milliseconds
    pub ttl_ms: u64,
    /// Background cleanup task interval in seconds
    pub cleanup_interval: u64,
    /// Store-level skip window in seconds
    pub resource_max_age: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `REQUEST_CACHE_TTL_MS` - Entry freshness window in ms (default: 30000)
    /// - `CLEANUP_INTERVAL` - Cleanup frequency in seconds (default: 60)
    /// - `RESOURCE_MAX_AGE` - Store skip window in seconds (default: 300)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ttl_ms: env::var("REQUEST_CACHE_TTL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.ttl_ms),
            cleanup_interval: env::var("CLEANUP_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.cleanup_interval),
            resource_max_age: env::var("RESOURCE_MAX_AGE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.resource_max_age),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    pub fn resource_max_age(&self) -> Duration {
        Duration::from_secs(self.resource_max_age)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            cleanup_interval: 60,
            resource_max_age: 300,
        }
    }
}
