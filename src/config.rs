//! Configuration Loading
//!
//! Every tier owns a config struct with sensible defaults. This module adds
//! YAML loading and validation for the composed [`MultiTierCacheConfig`].
//!
//! ```yaml
//! enable_fallback: true
//! memory:
//!   max_size: 5000
//!   default_ttl_ms: 300000
//! disk:
//!   max_retries: 2
//!   retry_delay_ms: 50
//! query:
//!   slow_query_threshold_ms: 500
//! ```

use std::path::Path;

use crate::cache::MultiTierCacheConfig;
use crate::error::{Error, Result};

/// Serde helper storing a `Duration` as integer milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

impl MultiTierCacheConfig {
    /// Parse a configuration document. Missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Reject values no tier can operate with.
    ///
    /// `memory.max_size == 0` is accepted: it selects never-store mode.
    pub fn validate(&self) -> Result<()> {
        if self.memory.default_ttl.is_zero() {
            return Err(Error::Config("memory.default_ttl must be > 0".into()));
        }
        if self.memory.cleanup_interval.is_zero() {
            return Err(Error::Config(
                "memory.cleanup_interval must be > 0".into(),
            ));
        }
        if self.disk.default_ttl.is_zero() {
            return Err(Error::Config("disk.default_ttl must be > 0".into()));
        }
        if !(self.disk.alert_threshold > 0.0 && self.disk.alert_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "disk.alert_threshold must be in (0, 1], got {}",
                self.disk.alert_threshold
            )));
        }
        if self.query.batch_size == 0 {
            return Err(Error::Config("query.batch_size must be > 0".into()));
        }
        if self.query.connection_pool_size == 0 {
            return Err(Error::Config(
                "query.connection_pool_size must be > 0".into(),
            ));
        }
        if self.query.enable_query_cache && self.query.cache_timeout.is_zero() {
            return Err(Error::Config(
                "query.cache_timeout must be > 0 when the query cache is enabled".into(),
            ));
        }
        if self.enable_metrics && self.stats_interval.is_zero() {
            return Err(Error::Config("stats_interval must be > 0".into()));
        }
        Ok(())
    }
}
