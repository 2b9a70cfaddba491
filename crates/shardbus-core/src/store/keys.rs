//! Key and stream naming shared by every backend

/// `{prefix}:{channel}:{shard}:{group}`
pub fn shard_lock_key(prefix: &str, channel: &str, shard: u32, group: &str) -> String {
    format!("{{{}}}:{}:{}:{}", prefix, channel, shard, group)
}

/// `{prefix}:SERVICE_LIVENESS:{consumer_id}`
pub fn liveness_key(prefix: &str, consumer_id: &str) -> String {
    format!("{{{}}}:SERVICE_LIVENESS:{}", prefix, consumer_id)
}

/// Join non-empty `parts` with `:`
///
/// `prefixed_key(&["", "job"])` is `job`; `prefixed_key(&["LOCKS", "job"])`
/// is `LOCKS:job`.
pub fn prefixed_key(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(":")
}

/// Stream holding shard `shard` of `channel`
pub fn shard_stream(channel: &str, shard: u32) -> String {
    format!("{}${}", channel, shard)
}

/// Split `channel$shard` into its logical channel and shard id.
/// Names without a numeric suffix are returned as-is.
pub fn split_shard_stream(stream: &str) -> (&str, Option<u32>) {
    match stream.rsplit_once('$') {
        Some((channel, shard)) => match shard.parse::<u32>() {
            Ok(id) => (channel, Some(id)),
            Err(_) => (stream, None),
        },
        None => (stream, None),
    }
}
