//! Error types for shardbus-core

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Redis command or connection failure
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Store failure not tied to a Redis error (memory store, bad reply shape)
    #[error("store error: {0}")]
    Store(String),

    /// A stream was read before its consumer group existed
    #[error("no consumer group for stream read: {0}")]
    NoGroup(String),

    /// A script could not be run even after reloading it
    #[error("script error: {0}")]
    Script(String),

    /// Message envelope could not be packed or unpacked
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid configuration
    #[error("invalid configuration: {field}: {message}")]
    InvalidConfig {
        /// Config field name
        field: String,
        /// Detailed message
        message: String,
    },

    /// Subscription attempted after the subscriber started
    #[error("cannot subscribe to `{0}` while the subscriber is running")]
    AlreadyRunning(String),

    /// Shard count outside of the lockable range
    #[error("invalid shard count {0}: must be between 1 and 32")]
    InvalidShardCount(u32),

    /// Request/reply deadline exceeded
    #[error("timed out waiting for a reply on {0}")]
    Timeout(String),

    /// Message handler failure
    #[error("handler error: {0}")]
    Handler(String),
}

impl Error {
    /// Build an [`Error::InvalidConfig`]
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the error is a transient store problem the read loop should ride out
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Error::Store(_) => true,
            _ => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
