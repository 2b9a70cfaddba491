//! Shard lock coordination
//!
//! Each (channel, shard) pair of a consumer group is guarded by one store key
//! holding the owner's instance id. Acquisition and release run as single
//! atomic store operations, so any number of independent instances can
//! coordinate without a central party. A missing bit in an acquire result
//! simply means "someone else has it"; contention is never an error.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::validate_shards;
use crate::error::Result;
use crate::store::{shard_stream, split_shard_stream, ShardScope, Store};

/// Mask covering every shard a lock script can address
pub const ALL_SHARDS: u32 = u32::MAX;

/// Per-channel lock masks, in channel order
pub type LockMasks = Vec<(String, u32)>;

/// Acquires and releases shard locks on behalf of one consumer instance
pub struct ShardLockCoordinator {
    store: Arc<dyn Store>,
    prefix: String,
    consumer_group: String,
    consumer_id: String,
    shard_count: u32,
}

impl ShardLockCoordinator {
    /// Create a coordinator
    ///
    /// # Errors
    ///
    /// Returns error if `shard_count` is outside `1..=32`
    pub fn new(
        store: Arc<dyn Store>,
        prefix: impl Into<String>,
        consumer_group: impl Into<String>,
        consumer_id: impl Into<String>,
        shard_count: u32,
    ) -> Result<Self> {
        validate_shards(shard_count)?;
        Ok(Self {
            store,
            prefix: prefix.into(),
            consumer_group: consumer_group.into(),
            consumer_id: consumer_id.into(),
            shard_count,
        })
    }

    fn scope(&self) -> ShardScope<'_> {
        ShardScope {
            prefix: &self.prefix,
            consumer_group: &self.consumer_group,
            consumer_id: &self.consumer_id,
            shard_count: self.shard_count,
        }
    }

    /// Shards per channel
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Mask with one bit per configured shard
    pub fn full_mask(&self) -> u32 {
        if self.shard_count >= 32 {
            ALL_SHARDS
        } else {
            (1u32 << self.shard_count) - 1
        }
    }

    /// Lock every free shard of `channels`.
    ///
    /// Bit `i` of a channel's mask is set iff shard `i` was acquired by this call.
    pub async fn acquire(&self, channels: &[String]) -> Result<LockMasks> {
        if channels.is_empty() {
            return Ok(Vec::new());
        }

        let mut masks = self.store.lock_shards(&self.scope(), channels).await?;
        let full = self.full_mask();
        for (_, mask) in masks.iter_mut() {
            *mask &= full;
        }

        trace!(consumer = %self.consumer_id, masks = ?masks, "Shard locks acquired");
        Ok(masks)
    }

    /// Release the shards flagged in `masks`; locks owned by others are untouched
    pub async fn release(&self, masks: &[(String, u32)]) -> Result<()> {
        let masks: Vec<(String, u32)> = masks
            .iter()
            .filter(|(_, mask)| *mask != 0)
            .cloned()
            .collect();
        if masks.is_empty() {
            return Ok(());
        }
        self.store.unlock_shards(&self.scope(), &masks).await
    }

    /// Release every shard of `channels` this instance may hold
    pub async fn release_all(&self, channels: &[String]) -> Result<()> {
        let masks: LockMasks = channels
            .iter()
            .map(|channel| (channel.clone(), ALL_SHARDS))
            .collect();
        self.release(&masks).await
    }

    /// Release every shard of `channels` except those whose stream produced entries
    pub async fn release_idle(&self, channels: &[String], active_streams: &[&str]) -> Result<()> {
        let mut keep: HashMap<&str, u32> = HashMap::new();
        for stream in active_streams {
            if let (channel, Some(shard)) = split_shard_stream(stream) {
                if shard < 32 {
                    *keep.entry(channel).or_default() |= 1 << shard;
                }
            }
        }

        let masks: LockMasks = channels
            .iter()
            .map(|channel| {
                let kept = keep.get(channel.as_str()).copied().unwrap_or(0);
                (channel.clone(), ALL_SHARDS & !kept)
            })
            .collect();

        debug!(consumer = %self.consumer_id, kept = ?keep, "Releasing idle shards");
        self.release(&masks).await
    }

    /// Stream names (`channel$shard`) for every bit set in `masks`
    pub fn locked_streams(&self, masks: &[(String, u32)]) -> Vec<String> {
        masks
            .iter()
            .flat_map(|(channel, mask)| {
                (0..self.shard_count)
                    .filter(move |&shard| mask & (1u32 << shard) != 0)
                    .map(move |shard| shard_stream(channel, shard))
            })
            .collect()
    }
}
