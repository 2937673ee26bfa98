//! Relay configuration loaded at startup.
//!
//! The configuration is a JSON document:
//!
//! ```json
//! {
//!     "origin": { "address": "http://xds.internal:18000", "aggregated": false },
//!     "cache": { "eviction_grace_ms": 30000 },
//!     "upstream": { "initial_backoff_ms": 1000, "max_backoff_ms": 30000, "jitter": 0.2 },
//!     "aggregation": { "rules": [] },
//!     "log_level": "info"
//! }
//! ```
//!
//! Only `origin.address` is required.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::logging;
use crate::mapper::{AggregationRules, KeyMapper};
use crate::upstream::config::UpstreamConfig;
use crate::upstream::retry::RetryPolicy;

/// Top-level relay configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// The origin management server.
    pub origin: OriginConfig,
    /// Cache settings.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Upstream stream settings.
    #[serde(default)]
    pub upstream: UpstreamSettings,
    /// Aggregation key rules.
    #[serde(default)]
    pub aggregation: AggregationRules,
    /// Initial log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where the origin management server lives.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OriginConfig {
    /// URI of the origin, e.g. `http://xds.internal:18000`.
    pub address: String,
    /// Stream every type over the aggregated discovery service.
    #[serde(default)]
    pub aggregated: bool,
}

/// Cache settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    /// Milliseconds an entry without watches survives. Zero evicts immediately.
    pub eviction_grace_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            eviction_grace_ms: 30_000,
        }
    }
}

/// Upstream stream settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamSettings {
    /// Delay before the first reconnect, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for reconnect delays, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor of reconnect delays.
    pub backoff_multiplier: f64,
    /// Random spread of reconnect delays, as a fraction in `[0, 1]`.
    pub jitter: f64,
    /// Consecutive failures after which reconnects are logged as errors.
    pub retry_ceiling: Option<usize>,
    /// Capacity of each stream's outbound request queue.
    pub outbound_queue_size: usize,
    /// Time a closing stream gets to flush queued requests, in milliseconds.
    pub shutdown_deadline_ms: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: 0.2,
            retry_ceiling: None,
            outbound_queue_size: 64,
            shutdown_deadline_ms: 5_000,
        }
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl RelayConfig {
    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check every value that can be checked without connecting.
    pub fn validate(&self) -> Result<()> {
        if self.origin.address.trim().is_empty() {
            return Err(Error::Validation("origin.address must not be empty".into()));
        }
        self.upstream_config()?;
        self.key_mapper()?;
        self.log_level()?;
        Ok(())
    }

    /// Cache settings as runtime configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            eviction_grace: Duration::from_millis(self.cache.eviction_grace_ms),
        }
    }

    /// Upstream settings as validated runtime configuration.
    pub fn upstream_config(&self) -> Result<UpstreamConfig> {
        let settings = &self.upstream;
        let policy = RetryPolicy::new(
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_millis(settings.max_backoff_ms),
            settings.backoff_multiplier,
        )?
        .with_jitter(settings.jitter)?
        .with_retry_ceiling(settings.retry_ceiling);

        Ok(UpstreamConfig::new()
            .with_retry_policy(policy)
            .with_outbound_queue_size(settings.outbound_queue_size)?
            .with_shutdown_deadline(Duration::from_millis(settings.shutdown_deadline_ms)))
    }

    /// Compile the aggregation rules.
    pub fn key_mapper(&self) -> Result<KeyMapper> {
        KeyMapper::new(&self.aggregation)
    }

    /// The initial log level.
    pub fn log_level(&self) -> Result<tracing::Level> {
        logging::parse_level(&self.log_level)
    }
}
