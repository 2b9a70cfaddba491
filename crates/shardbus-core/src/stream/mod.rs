//! Stream messaging
//!
//! - [`partition`]: key → shard mapping for publishers
//! - [`shard_lock`]: per-shard exclusive locks shared by a consumer group
//! - [`StreamSubscriber`]: sharded consumer-group reads with adaptive blocking
//! - [`BroadcastSubscriber`]: fan-out delivery over pub/sub
//! - [`EventManager`]: publish, subscribe and request/reply facade

mod block_time;
mod broadcast;
mod event_manager;
pub mod partition;
pub mod shard_lock;
mod subscriber;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tracing::error;

use crate::codec::Message;
use crate::error::Result;

pub use block_time::BlockTime;
pub use broadcast::BroadcastSubscriber;
pub use event_manager::{EventManager, PublishOptions, SubscriptionMode};
pub use partition::partition_for;
pub use shard_lock::{LockMasks, ShardLockCoordinator, ALL_SHARDS};
pub use subscriber::{StreamSubscriber, SubscriberState};

/// Future returned by a message handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Callback invoked with `(channel, message)` for each delivery
pub type MessageHandler = Arc<dyn Fn(String, Message) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(String, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |channel, message| Box::pin(f(channel, message)))
}

/// Channel → handlers table, frozen when a subscriber starts
#[derive(Clone, Default)]
pub(crate) struct Routes {
    channels: Vec<String>,
    handlers: HashMap<String, Vec<MessageHandler>>,
}

impl Routes {
    pub(crate) fn add(&mut self, channel: String, handler: MessageHandler) {
        if !self.handlers.contains_key(&channel) {
            self.channels.push(channel.clone());
        }
        self.handlers.entry(channel).or_default().push(handler);
    }

    /// Channels in subscription order
    pub(crate) fn channels(&self) -> &[String] {
        &self.channels
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Hand `message` to every handler of `channel`; returns how many succeeded
    pub(crate) async fn deliver(&self, channel: &str, message: Message) -> usize {
        let Some(handlers) = self.handlers.get(channel) else {
            return 0;
        };
        let mut succeeded = 0;
        for handler in handlers {
            if dispatch(handler, channel, message.clone()).await {
                succeeded += 1;
            }
        }
        succeeded
    }
}

/// Run `handler`, logging failures and panics instead of propagating them.
///
/// Returns true when the handler completed successfully.
pub(crate) async fn dispatch(handler: &MessageHandler, channel: &str, message: Message) -> bool {
    let message_id = message.id.clone();
    let call = async { handler(channel.to_string(), message).await };

    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(channel, message_id = %message_id, error = %e, "Message handler failed");
            false
        }
        Err(_) => {
            error!(channel, message_id = %message_id, "Message handler panicked");
            false
        }
    }
}
