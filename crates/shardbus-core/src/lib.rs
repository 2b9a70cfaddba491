//! Shardbus Core - distributed event bus over Redis
//!
//! This crate provides the building blocks of a service instance on the bus:
//! - Store: the key/stream/pub-sub capability (Redis or in-memory)
//! - Stream: sharded consumer-group subscriptions, broadcasts and the event manager
//! - Lock: a distributed mutex with owner-checked release and renewal
//! - Counter, KvStore, CacheAdapter: shared counters, values and cache entries
//! - Periodic: cron, interval and one-shot tasks, optionally once per service
//! - Codec: the versioned message envelope

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod codec;
pub mod config;
pub mod counter;
pub mod error;
pub mod kv;
pub mod lock;
pub mod periodic;
pub mod store;
pub mod stream;

pub use cache::CacheAdapter;
pub use codec::{Headers, Message};
pub use config::{EventManagerConfig, PeriodicConfig, StreamOptions, SubscriberConfig};
pub use counter::Counter;
pub use error::{Error, Result};
pub use kv::KvStore;
pub use lock::DistributedLock;
pub use periodic::{NoneLocker, StoreLocker, Task, TaskScheduler};
pub use store::{MemoryStore, RedisStore, Store};
pub use stream::{
    handler, EventManager, MessageHandler, PublishOptions, StreamSubscriber, SubscriptionMode,
};
