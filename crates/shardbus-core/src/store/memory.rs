use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::keys::{liveness_key, shard_lock_key};
use super::{
    GroupRead, PubSubMessage, PubSubStream, ShardScope, Store, StreamBatch, StreamEntry,
    SHARD_LOCK_TTL_SECS,
};
use crate::error::{Error, Result};

/// Pub/sub buffer per subscriber before it starts lagging
const PUBSUB_CAPACITY: usize = 1024;

struct KeyEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct MemoryStream {
    /// (offset, entry), oldest first
    entries: VecDeque<(u64, StreamEntry)>,
    next_offset: u64,
    last_id: (u64, u64),
    /// Group name -> first offset not yet delivered to the group
    groups: HashMap<String, u64>,
}

impl MemoryStream {
    fn next_id(&mut self) -> String {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let (last_ms, last_seq) = self.last_id;
        self.last_id = if now_ms > last_ms {
            (now_ms, 0)
        } else {
            (last_ms, last_seq + 1)
        };
        format!("{}-{}", self.last_id.0, self.last_id.1)
    }
}

#[derive(Default)]
struct State {
    keys: HashMap<String, KeyEntry>,
    streams: HashMap<String, MemoryStream>,
}

impl State {
    fn live_value(&mut self, key: &str) -> Option<&str> {
        let expired = self
            .keys
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.keys.remove(key);
        }
        self.keys.get(key).map(|entry| entry.value.as_str())
    }

    fn put(&mut self, key: &str, value: &str, ttl: Duration) {
        self.put_until(key, value, Some(Instant::now() + ttl));
    }

    fn put_until(&mut self, key: &str, value: &str, expires_at: Option<Instant>) {
        self.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                expires_at,
            },
        );
    }
}

/// In-process store (for development/testing)
///
/// Mirrors the Redis backend: TTL keys, the shard-lock rules (including
/// takeover of locks whose owner has no liveness key), streams with consumer
/// groups positioned at the tail, blocking reads woken by appends, and
/// pub/sub fan-out.
pub struct MemoryStore {
    state: Mutex<State>,
    appended: Notify,
    pubsub: broadcast::Sender<PubSubMessage>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            pubsub,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
    }

    /// Number of entries currently retained in `stream`
    pub fn stream_len(&self, stream: &str) -> usize {
        self.state()
            .map(|state| state.streams.get(stream).map_or(0, |s| s.entries.len()))
            .unwrap_or(0)
    }

    fn take_entries(&self, read: &GroupRead<'_>) -> Result<Vec<StreamBatch>> {
        let mut state = self.state()?;

        // Like XREADGROUP, a single missing group fails the whole read
        for name in read.streams {
            let has_group = state
                .streams
                .get(name)
                .is_some_and(|stream| stream.groups.contains_key(read.group));
            if !has_group {
                return Err(Error::NoGroup(name.clone()));
            }
        }

        let mut batches = Vec::new();
        for name in read.streams {
            let Some(stream) = state.streams.get_mut(name) else {
                continue;
            };
            let next = stream.groups.get(read.group).copied().unwrap_or(stream.next_offset);

            let picked: Vec<(u64, StreamEntry)> = stream
                .entries
                .iter()
                .filter(|(offset, _)| *offset >= next)
                .take(read.count)
                .cloned()
                .collect();

            if let Some((last, _)) = picked.last() {
                stream.groups.insert(read.group.to_string(), last + 1);
                batches.push(StreamBatch {
                    stream: name.clone(),
                    entries: picked.into_iter().map(|(_, entry)| entry).collect(),
                });
            }
        }
        Ok(batches)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn lock_shards(
        &self,
        scope: &ShardScope<'_>,
        channels: &[String],
    ) -> Result<Vec<(String, u32)>> {
        let ttl = Duration::from_secs(SHARD_LOCK_TTL_SECS);
        let mut state = self.state()?;
        let mut result = Vec::with_capacity(channels.len());

        for channel in channels {
            let mut flags = 0u32;
            for shard in 0..scope.shard_count {
                let key = shard_lock_key(scope.prefix, channel, shard, scope.consumer_group);
                let owner = state.live_value(&key).map(str::to_string);
                let free = match owner {
                    None => true,
                    Some(owner) if owner == scope.consumer_id => false,
                    Some(owner) => state.live_value(&liveness_key(scope.prefix, &owner)).is_none(),
                };
                if free {
                    state.put(&key, scope.consumer_id, ttl);
                    flags |= 1 << shard;
                }
            }
            result.push((channel.clone(), flags));
        }
        Ok(result)
    }

    async fn unlock_shards(&self, scope: &ShardScope<'_>, masks: &[(String, u32)]) -> Result<()> {
        let mut state = self.state()?;
        for (channel, mask) in masks {
            for shard in 0..scope.shard_count {
                if mask & (1 << shard) == 0 {
                    continue;
                }
                let key = shard_lock_key(scope.prefix, channel, shard, scope.consumer_group);
                if state.live_value(&key) == Some(scope.consumer_id) {
                    state.keys.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.state()?;
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        let tail = stream_state.next_offset;
        if !stream_state.groups.contains_key(group) {
            stream_state.groups.insert(group.to_string(), tail);
            debug!(stream = %stream, group = %group, "Consumer group created");
        }
        Ok(())
    }

    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<StreamBatch>> {
        if read.streams.is_empty() {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + read.block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batches = self.take_entries(read)?;
            if !batches.is_empty() {
                return Ok(batches);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn append(&self, stream: &str, payload: &[u8], max_len: usize) -> Result<Option<String>> {
        let id = {
            let mut state = self.state()?;
            let Some(stream_state) = state.streams.get_mut(stream) else {
                return Ok(None);
            };

            let id = stream_state.next_id();
            let offset = stream_state.next_offset;
            stream_state.next_offset += 1;
            stream_state.entries.push_back((
                offset,
                StreamEntry {
                    id: id.clone(),
                    payload: payload.to_vec(),
                },
            ));
            while stream_state.entries.len() > max_len.max(1) {
                stream_state.entries.pop_front();
            }
            id
        };

        self.appended.notify_waiters();
        Ok(Some(id))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state()?;
        if state.live_value(key).is_some() {
            return Ok(false);
        }
        state.put(key, value, ttl);
        Ok(true)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.state()?.put(key, value, ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state()?.live_value(key).map(str::to_string))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.state()?.put_until(key, value, None);
        Ok(())
    }

    async fn incr_by(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64> {
        let mut state = self.state()?;
        let current = match state.live_value(key) {
            Some(value) => value
                .parse::<i64>()
                .map_err(|_| Error::Store(format!("value of {} is not an integer", key)))?,
            None => 0,
        };
        let value = current
            .checked_add(amount)
            .ok_or_else(|| Error::Store(format!("increment of {} would overflow", key)))?;

        // INCRBY keeps an existing expiry
        let expires_at = match ttl {
            Some(ttl) => Some(Instant::now() + ttl),
            None => state.keys.get(key).and_then(|entry| entry.expires_at),
        };
        state.put_until(key, &value.to_string(), expires_at);
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state()?;
        let existed = state.live_value(key).is_some();
        state.keys.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.state()?.live_value(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut state = self.state()?;
        let now = Instant::now();
        let mut removed = 0;
        state.keys.retain(|key, entry| {
            if !key.starts_with(prefix) {
                return true;
            }
            // Already expired keys go too, but only live ones are counted
            if entry.expires_at.map_or(true, |at| at > now) {
                removed += 1;
            }
            false
        });
        Ok(removed)
    }

    async fn delete_if_owner(&self, key: &str, owner: &str) -> Result<bool> {
        let mut state = self.state()?;
        if state.live_value(key) == Some(owner) {
            state.keys.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn expire_if_owner(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state()?;
        if state.live_value(key) == Some(owner) {
            state.put(key, owner, ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        // No subscribers is not an error for fire-and-forget
        let _ = self.pubsub.send(PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<PubSubStream> {
        let wanted: Arc<HashSet<String>> = Arc::new(channels.iter().cloned().collect());
        let rx = self.pubsub.subscribe();

        let stream = futures::stream::unfold(rx, move |mut rx| {
            let wanted = wanted.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) if wanted.contains(&msg.channel) => return Some((msg, rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Pub/sub subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests;
