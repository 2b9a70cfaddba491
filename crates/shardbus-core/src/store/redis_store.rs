use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::streams::StreamReadReply;
use redis::{AsyncConnectionConfig, FromRedisValue};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::{GroupRead, PubSubMessage, PubSubStream, ShardScope, Store, StreamBatch, StreamEntry};
use crate::error::{Error, Result};

/// A Lua script known by name, loaded lazily and run by SHA
struct LuaScript {
    name: &'static str,
    source: &'static str,
}

/// Lock every free shard of the given channels.
///
/// KEYS[1] = prefix, ARGV = group, consumer id, shard count, channels...
/// A shard is free when unlocked or when its owner has no liveness key.
/// Returns a flat list of (channel, newly-acquired mask) pairs.
const LOCK_SHARDS: LuaScript = LuaScript {
    name: "lock_shards",
    source: r#"
local prefix = "{" .. KEYS[1] .. "}"
local group = ARGV[1]
local consumer = ARGV[2]
local shards = tonumber(ARGV[3])
local result = {}

for i = 4, #ARGV do
  local channel = ARGV[i]
  local flags = 0
  for shard = 0, shards - 1 do
    local key = prefix .. ":" .. channel .. ":" .. shard .. ":" .. group
    local owner = redis.call("GET", key)
    local free = not owner
    if owner and owner ~= consumer then
      free = redis.call("EXISTS", prefix .. ":SERVICE_LIVENESS:" .. owner) == 0
    end
    if free then
      redis.call("SET", key, consumer, "EX", 600)
      flags = bit.bor(flags, bit.lshift(1, shard))
    end
  end
  table.insert(result, channel)
  table.insert(result, tostring(flags))
end

return result
"#,
};

/// Release flagged shards held by the caller.
///
/// KEYS[1] = prefix, ARGV = group, consumer id, shard count, (channel, mask)...
const UNLOCK_SHARDS: LuaScript = LuaScript {
    name: "unlock_shards",
    source: r#"
local prefix = "{" .. KEYS[1] .. "}"
local group = ARGV[1]
local consumer = ARGV[2]
local shards = tonumber(ARGV[3])
local released = 0

for i = 4, #ARGV, 2 do
  local channel = ARGV[i]
  local flags = tonumber(ARGV[i + 1])
  for shard = 0, shards - 1 do
    if bit.band(flags, bit.lshift(1, shard)) ~= 0 then
      local key = prefix .. ":" .. channel .. ":" .. shard .. ":" .. group
      if redis.call("GET", key) == consumer then
        redis.call("DEL", key)
        released = released + 1
      end
    end
  end
end

return released
"#,
};

const RELEASE_IF_OWNER: LuaScript = LuaScript {
    name: "release_if_owner",
    source: r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#,
};

const RENEW_IF_OWNER: LuaScript = LuaScript {
    name: "renew_if_owner",
    source: r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
  return 0
end
"#,
};

/// Keys requested per SCAN round trip
const SCAN_BATCH: usize = 500;

/// Redis-backed store (for production)
///
/// Short commands share one multiplexed connection. Blocking stream reads
/// go through a second connection without a client-side response timeout,
/// so a read is never abandoned while Redis may still hand it entries.
pub struct RedisStore {
    client: redis::Client,
    shared: OnceCell<redis::aio::MultiplexedConnection>,
    /// Connection for `XREADGROUP BLOCK`; dropped and rebuilt after I/O errors
    reader: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    /// SHA of each loaded script, by script name
    scripts: Mutex<HashMap<&'static str, String>>,
}

impl RedisStore {
    /// Create a new Redis store
    ///
    /// # Errors
    ///
    /// Returns error if Redis URL is invalid
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;

        Ok(Self {
            client,
            shared: OnceCell::new(),
            reader: tokio::sync::Mutex::new(None),
            scripts: Mutex::new(HashMap::new()),
        })
    }

    /// Shared connection for non-blocking commands
    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self
            .shared
            .get_or_try_init(|| async {
                let conn = self.client.get_multiplexed_async_connection().await?;
                info!("Connected to Redis");
                Ok::<_, Error>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    /// Connection for blocking reads. The block time bounds every read, so
    /// no response timeout is set.
    async fn blocking_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut reader = self.reader.lock().await;
        if let Some(conn) = reader.as_ref() {
            return Ok(conn.clone());
        }

        let config = AsyncConnectionConfig::new().set_response_timeout(None);
        let conn = self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;
        debug!("Opened stream read connection");
        *reader = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_blocking_connection(&self) {
        self.reader.lock().await.take();
    }

    fn cached_sha(&self, script: &LuaScript) -> Option<String> {
        self.scripts
            .lock()
            .ok()
            .and_then(|scripts| scripts.get(script.name).cloned())
    }

    fn forget_script(&self, script: &LuaScript) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.remove(script.name);
        }
    }

    async fn load_script(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        script: &LuaScript,
    ) -> Result<String> {
        if let Some(sha) = self.cached_sha(script) {
            return Ok(sha);
        }

        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.source)
            .query_async(conn)
            .await?;
        debug!(script = script.name, sha = %sha, "Script loaded");

        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(script.name, sha.clone());
        }
        Ok(sha)
    }

    /// `EVALSHA`, reloading the script once if the server lost it
    async fn run_script<T: FromRedisValue>(
        &self,
        script: &LuaScript,
        keys: &[&str],
        args: &[String],
    ) -> Result<T> {
        let mut conn = self.connection().await?;
        let mut retried = false;

        loop {
            let sha = self.load_script(&mut conn, script).await?;
            let reply = redis::cmd("EVALSHA")
                .arg(&sha)
                .arg(keys.len())
                .arg(keys)
                .arg(args)
                .query_async::<T>(&mut conn)
                .await;

            match reply {
                Ok(value) => return Ok(value),
                Err(e) if !retried && e.to_string().contains("NOSCRIPT") => {
                    warn!(script = script.name, "Script missing on server, reloading");
                    self.forget_script(script);
                    retried = true;
                }
                Err(e) => {
                    error!(script = script.name, error = %e, "Script execution failed");
                    return Err(Error::Script(format!("{}: {}", script.name, e)));
                }
            }
        }
    }
}

fn scope_args(scope: &ShardScope<'_>) -> Vec<String> {
    vec![
        scope.consumer_group.to_string(),
        scope.consumer_id.to_string(),
        scope.shard_count.to_string(),
    ]
}

fn parse_mask_pairs(flat: Vec<String>) -> Result<Vec<(String, u32)>> {
    if flat.len() % 2 != 0 {
        return Err(Error::Store(format!(
            "lock script returned an odd number of values ({})",
            flat.len()
        )));
    }

    flat.chunks(2)
        .map(|pair| {
            let mask = pair[1]
                .parse::<i64>()
                .map_err(|e| Error::Store(format!("bad lock mask {:?}: {}", pair[1], e)))?;
            Ok((pair[0].clone(), mask as u32))
        })
        .collect()
}

/// Escape the glob metacharacters of a SCAN MATCH pattern
fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl Store for RedisStore {
    async fn lock_shards(
        &self,
        scope: &ShardScope<'_>,
        channels: &[String],
    ) -> Result<Vec<(String, u32)>> {
        let mut args = scope_args(scope);
        args.extend(channels.iter().cloned());

        let flat: Vec<String> = self.run_script(&LOCK_SHARDS, &[scope.prefix], &args).await?;
        parse_mask_pairs(flat)
    }

    async fn unlock_shards(&self, scope: &ShardScope<'_>, masks: &[(String, u32)]) -> Result<()> {
        if masks.is_empty() {
            return Ok(());
        }

        let mut args = scope_args(scope);
        for (channel, mask) in masks {
            args.push(channel.clone());
            args.push(mask.to_string());
        }

        let released: i64 = self
            .run_script(&UNLOCK_SHARDS, &[scope.prefix], &args)
            .await?;
        debug!(released, consumer = scope.consumer_id, "Shard locks released");
        Ok(())
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.connection().await?;

        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<()>(&mut conn)
            .await;

        match created {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<StreamBatch>> {
        if read.streams.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.blocking_connection().await?;
        let block_ms = (read.block.as_millis() as u64).max(1);

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(read.group)
            .arg(read.consumer)
            .arg("COUNT")
            .arg(read.count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("NOACK")
            .arg("STREAMS")
            .arg(read.streams);
        for _ in read.streams {
            cmd.arg(">");
        }

        let reply: Option<StreamReadReply> = match cmd.query_async(&mut conn).await {
            Ok(reply) => reply,
            Err(e) if e.to_string().contains("NOGROUP") => {
                return Err(Error::NoGroup(read.streams.join(",")))
            }
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    self.reset_blocking_connection().await;
                }
                return Err(e.into());
            }
        };

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let batches = reply
            .keys
            .into_iter()
            .map(|key| {
                let entries = key
                    .ids
                    .into_iter()
                    .filter_map(|entry| match entry.get::<Vec<u8>>("msg") {
                        Some(payload) => Some(StreamEntry {
                            id: entry.id,
                            payload,
                        }),
                        None => {
                            warn!(stream = %key.key, id = %entry.id, "Stream entry without msg field");
                            None
                        }
                    })
                    .collect();
                StreamBatch {
                    stream: key.key,
                    entries,
                }
            })
            .filter(|batch: &StreamBatch| !batch.entries.is_empty())
            .collect();

        Ok(batches)
    }

    async fn append(&self, stream: &str, payload: &[u8], max_len: usize) -> Result<Option<String>> {
        let mut conn = self.connection().await?;

        let id: Option<String> = redis::cmd("XADD")
            .arg(stream)
            .arg("NOMKSTREAM")
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .arg("*")
            .arg("msg")
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        Ok(id)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;

        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(set.is_some())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;

        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;

        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.connection().await?;

        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn incr_by(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64> {
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("INCRBY").arg(key).arg(amount);
        if let Some(ttl) = ttl {
            pipe.cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.as_millis() as u64)
                .ignore();
        }

        let (value,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;

        let deleted: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;

        let found: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(found > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", escape_glob(prefix));

        let mut cursor: u64 = 0;
        let mut removed = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: usize = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, removed, "Deleted keys by prefix");
        Ok(removed)
    }

    async fn delete_if_owner(&self, key: &str, owner: &str) -> Result<bool> {
        let deleted: i64 = self
            .run_script(&RELEASE_IF_OWNER, &[key], &[owner.to_string()])
            .await?;
        Ok(deleted > 0)
    }

    async fn expire_if_owner(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let renewed: i64 = self
            .run_script(
                &RENEW_IF_OWNER,
                &[key],
                &[owner.to_string(), (ttl.as_millis() as u64).to_string()],
            )
            .await?;
        Ok(renewed > 0)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.connection().await?;

        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<PubSubStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        debug!(channels = ?channels, "Subscribed to pub/sub channels");

        let stream = pubsub.into_on_message().map(|msg| PubSubMessage {
            channel: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(stream.boxed())
    }
}
