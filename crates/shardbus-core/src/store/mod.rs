//! Store - the key-value / stream / pub-sub capability every component is built on
//!
//! Components never reach for a global connection; they receive an
//! `Arc<dyn Store>` on construction.
//!
//! - [`RedisStore`]: production backend, scripts run server-side
//! - [`MemoryStore`]: single-process backend with the same semantics, used
//!   in tests and local development

mod keys;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub use keys::{liveness_key, prefixed_key, shard_lock_key, shard_stream, split_shard_stream};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Expiry of a shard lock, in seconds
pub const SHARD_LOCK_TTL_SECS: u64 = 600;

/// Identity of a shard-lock caller
#[derive(Debug, Clone, Copy)]
pub struct ShardScope<'a> {
    /// Key prefix, without braces
    pub prefix: &'a str,
    /// Consumer group (service name)
    pub consumer_group: &'a str,
    /// Consumer instance (service instance id)
    pub consumer_id: &'a str,
    /// Shards per channel
    pub shard_count: u32,
}

/// Parameters of a consumer-group read
#[derive(Debug, Clone, Copy)]
pub struct GroupRead<'a> {
    /// Consumer group
    pub group: &'a str,
    /// Consumer name within the group
    pub consumer: &'a str,
    /// Streams to read, each from its last-delivered position
    pub streams: &'a [String],
    /// Maximum entries per stream
    pub count: usize,
    /// How long to wait for entries when none are available
    pub block: Duration,
}

/// One stream record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Store-assigned id (`<ms>-<seq>`)
    pub id: String,
    /// Encoded message envelope
    pub payload: Vec<u8>,
}

/// Entries read from one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatch {
    /// Stream name (may carry a `$shard` suffix)
    pub stream: String,
    /// Entries in store order
    pub entries: Vec<StreamEntry>,
}

/// A pub/sub delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Channel the message was published on
    pub channel: String,
    /// Raw payload
    pub payload: Vec<u8>,
}

/// Stream of pub/sub deliveries; ends when the connection drops
pub type PubSubStream = BoxStream<'static, PubSubMessage>;

/// Backing store capability
#[async_trait]
pub trait Store: Send + Sync {
    /// Lock every free shard of `channels`; returns `(channel, newly acquired mask)` per channel
    async fn lock_shards(&self, scope: &ShardScope<'_>, channels: &[String])
        -> Result<Vec<(String, u32)>>;

    /// Release the shards flagged in each mask, where this consumer owns them
    async fn unlock_shards(&self, scope: &ShardScope<'_>, masks: &[(String, u32)]) -> Result<()>;

    /// Create `group` on `stream` at the tail, creating the stream if needed.
    /// An existing group is not an error.
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Blocking consumer-group read without pending-entry tracking.
    /// Fails with [`crate::Error::NoGroup`] when a stream or group is missing.
    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<StreamBatch>>;

    /// Append to an existing stream, trimming to roughly `max_len` entries.
    /// Returns `None` when the stream does not exist yet.
    async fn append(&self, stream: &str, payload: &[u8], max_len: usize) -> Result<Option<String>>;

    /// `SET key value NX PX ttl`; true when the key was set
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// `SET key value PX ttl`
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// `GET key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `SET key value` without expiry
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// `INCRBY key amount`, then reset the expiry to `ttl` when one is given.
    /// Returns the new value.
    async fn incr_by(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64>;

    /// `DEL key`; true when a key was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// `EXISTS key`
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete every key starting with `prefix`; returns how many went away
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Delete `key` only if it holds `owner`
    async fn delete_if_owner(&self, key: &str, owner: &str) -> Result<bool>;

    /// Reset the expiry of `key` only if it holds `owner`
    async fn expire_if_owner(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Fire-and-forget publish
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Subscribe to `channels`; resolves once the subscription is active
    async fn subscribe(&self, channels: &[String]) -> Result<PubSubStream>;
}
