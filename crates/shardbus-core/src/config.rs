//! Configuration types for the stream layer and the periodic scheduler
//!
//! Every struct deserializes from TOML/env with per-field defaults, and
//! carries a `validate()` that the owning component calls on construction.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of shards per channel
pub const DEFAULT_SHARDS: u32 = 16;

/// Largest shard count a 32-bit lock mask can describe
pub const MAX_SHARDS: u32 = 32;

/// Longest accepted `max_block_time`, in seconds
pub const MAX_BLOCK_TIME: f64 = 300.0;

/// Read-loop tuning for [`crate::stream::StreamSubscriber`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Upper bound of the adaptive block time, in seconds
    #[serde(default = "default_max_block_time")]
    pub max_block_time: f64,
    /// Lower bound (and initial value) of the adaptive block time, in seconds
    #[serde(default = "default_min_block_time")]
    pub min_block_time: f64,
    /// Multiplicative step applied on each adaptation, in `(0, 1]`
    #[serde(default = "default_block_time_delta")]
    pub block_time_delta: f64,
    /// `COUNT` passed to each stream read
    #[serde(default = "default_max_messages_count")]
    pub max_messages_count: usize,
}

fn default_max_block_time() -> f64 {
    2.0
}

fn default_min_block_time() -> f64 {
    0.1
}

fn default_block_time_delta() -> f64 {
    0.7
}

fn default_max_messages_count() -> usize {
    10
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            max_block_time: default_max_block_time(),
            min_block_time: default_min_block_time(),
            block_time_delta: default_block_time_delta(),
            max_messages_count: default_max_messages_count(),
        }
    }
}

impl SubscriberConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set both block time bounds, in seconds
    pub fn with_block_time(mut self, min: f64, max: f64) -> Self {
        self.min_block_time = min;
        self.max_block_time = max;
        self
    }

    /// Set the adaptation step
    pub fn with_block_time_delta(mut self, delta: f64) -> Self {
        self.block_time_delta = delta;
        self
    }

    /// Set the per-read entry count
    pub fn with_max_messages_count(mut self, count: usize) -> Self {
        self.max_messages_count = count;
        self
    }

    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if !(self.block_time_delta > 0.0 && self.block_time_delta <= 1.0) {
            return Err(Error::invalid_config(
                "block_time_delta",
                "must be between 0 (exclusive) and 1",
            ));
        }
        if !(self.min_block_time > 0.0) {
            return Err(Error::invalid_config("min_block_time", "must be positive"));
        }
        if !(self.max_block_time.is_finite() && self.max_block_time <= MAX_BLOCK_TIME) {
            return Err(Error::invalid_config(
                "max_block_time",
                format!("must be a finite number of seconds up to {}", MAX_BLOCK_TIME),
            ));
        }
        if self.max_block_time < self.min_block_time {
            return Err(Error::invalid_config(
                "max_block_time",
                "must be greater than or equal to min_block_time",
            ));
        }
        if self.max_messages_count == 0 {
            return Err(Error::invalid_config(
                "max_messages_count",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Lower bound as a [`Duration`]
    pub fn min_block(&self) -> Duration {
        Duration::from_secs_f64(self.min_block_time)
    }
}

/// Per-stream publishing options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Approximate `MAXLEN` for `XADD`
    #[serde(default = "default_maxlen")]
    pub maxlen: usize,
}

fn default_maxlen() -> usize {
    1_000_000
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            maxlen: default_maxlen(),
        }
    }
}

/// Configuration of an [`crate::stream::EventManager`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventManagerConfig {
    /// Number of shards per channel; must match every publisher and subscriber
    #[serde(default = "default_shards")]
    pub shards: u32,
    /// Prefix of the shard-lock and liveness keyspace (wrapped in `{}` on use)
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,
    /// Default `MAXLEN` for streams without an override
    #[serde(default = "default_maxlen")]
    pub maxlen: usize,
    /// Per-stream overrides, keyed by channel
    #[serde(default)]
    pub streams: HashMap<String, StreamOptions>,
    /// Stream read-loop tuning
    #[serde(default)]
    pub subscriber: SubscriberConfig,
}

fn default_shards() -> u32 {
    DEFAULT_SHARDS
}

fn default_lock_prefix() -> String {
    "SHARDBUS:STREAM:SHARDLOCK".to_string()
}

impl Default for EventManagerConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            lock_prefix: default_lock_prefix(),
            maxlen: default_maxlen(),
            streams: HashMap::new(),
            subscriber: SubscriberConfig::default(),
        }
    }
}

impl EventManagerConfig {
    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        validate_shards(self.shards)?;
        if self.lock_prefix.is_empty() {
            return Err(Error::invalid_config("lock_prefix", "must not be empty"));
        }
        self.subscriber.validate()
    }

    /// `MAXLEN` to use when appending to `channel`
    pub fn maxlen_for(&self, channel: &str) -> usize {
        self.streams
            .get(channel)
            .map(|s| s.maxlen)
            .unwrap_or(self.maxlen)
    }
}

/// Configuration of the periodic task scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicConfig {
    /// Due tasks waiting for the executioner before the scheduler blocks
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Prefix of per-service task lock keys
    #[serde(default = "default_periodic_lock_prefix")]
    pub lock_prefix: String,
    /// Expiry of a per-service task lock, in seconds
    #[serde(default = "default_periodic_lock_ttl")]
    pub lock_ttl_secs: u64,
}

fn default_queue_capacity() -> usize {
    10
}

fn default_periodic_lock_prefix() -> String {
    "SHARDBUS:PERIODIC:LOCK".to_string()
}

fn default_periodic_lock_ttl() -> u64 {
    86_400
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            lock_prefix: default_periodic_lock_prefix(),
            lock_ttl_secs: default_periodic_lock_ttl(),
        }
    }
}

impl PeriodicConfig {
    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::invalid_config("queue_capacity", "must be at least 1"));
        }
        if self.lock_ttl_secs == 0 {
            return Err(Error::invalid_config("lock_ttl_secs", "must be positive"));
        }
        Ok(())
    }

    /// Lock expiry as a [`Duration`]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// Reject shard counts a lock mask cannot represent
pub fn validate_shards(shards: u32) -> Result<()> {
    if shards == 0 || shards > MAX_SHARDS {
        return Err(Error::InvalidShardCount(shards));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
