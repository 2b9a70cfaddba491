//! Event manager: the publish/subscribe facade a service talks to
//!
//! Subscriptions come in three modes:
//!
//! - [`SubscriptionMode::Consumer`]: persistent stream, each message handled
//!   by one instance of the service, ordered per key
//! - [`SubscriptionMode::Broadcast`]: pub/sub, every instance handles every message
//! - [`SubscriptionMode::Command`]: pub/sub, one instance wins each message
//!
//! `publish` writes both the pub/sub channel and the (sharded) stream, so one
//! message reaches every mode.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broadcast::BroadcastSubscriber;
use super::partition::partition_for;
use super::subscriber::StreamSubscriber;
use super::MessageHandler;
use crate::codec::{Headers, Message};
use crate::config::EventManagerConfig;
use crate::error::{Error, Result};
use crate::store::{shard_stream, Store};

/// How a channel is consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Sharded stream, one instance per message
    Consumer,
    /// Pub/sub fan-out to every instance
    Broadcast,
    /// Pub/sub, one instance per message via a per-message lock
    Command,
}

/// Optional publish parameters
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Message headers
    pub headers: Headers,
    /// Partition key; messages with the same key share a shard
    pub key: Option<String>,
    /// Channel replies should be published to
    pub reply_to: Option<String>,
}

impl PublishOptions {
    /// Create empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the partition key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the headers
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Add one header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the reply channel
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Publish/subscribe facade for one service instance
pub struct EventManager {
    store: Arc<dyn Store>,
    config: EventManagerConfig,
    service_name: String,
    service_id: String,
    streams: StreamSubscriber,
    broadcasts: BroadcastSubscriber,
}

impl EventManager {
    /// Create an event manager for `service_name`, instance `service_id`
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        store: Arc<dyn Store>,
        config: EventManagerConfig,
        service_name: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;
        let service_name = service_name.into();
        let service_id = service_id.into();

        let streams = StreamSubscriber::new(
            store.clone(),
            config.subscriber.clone(),
            config.lock_prefix.clone(),
            service_name.clone(),
            service_id.clone(),
            config.shards,
        )?;
        let broadcasts = BroadcastSubscriber::new(
            store.clone(),
            config.lock_prefix.clone(),
            service_name.clone(),
            service_id.clone(),
        );

        Ok(Self {
            store,
            config,
            service_name,
            service_id,
            streams,
            broadcasts,
        })
    }

    /// Service (consumer group) name
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Instance id
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Register `handler` on `channel`. Only allowed before [`start`](Self::start).
    pub fn subscribe(
        &self,
        channel: impl Into<String>,
        mode: SubscriptionMode,
        handler: MessageHandler,
    ) -> Result<()> {
        let channel = channel.into();
        debug!(channel = %channel, mode = ?mode, "Subscribing");
        match mode {
            SubscriptionMode::Consumer => self.streams.subscribe(channel, handler),
            SubscriptionMode::Broadcast => self.broadcasts.subscribe(channel, false, handler),
            SubscriptionMode::Command => self.broadcasts.subscribe(channel, true, handler),
        }
    }

    /// Start every subscriber
    pub async fn start(&self) -> Result<()> {
        self.streams.start().await?;
        if let Err(e) = self.broadcasts.start().await {
            self.streams.stop().await;
            return Err(e);
        }
        info!(service = %self.service_name, instance = %self.service_id, "Event manager started");
        Ok(())
    }

    /// Stop every subscriber. Idempotent.
    pub async fn stop(&self) {
        self.broadcasts.stop().await;
        self.streams.stop().await;
    }

    /// Publish `content` on `channel`; returns the message id.
    ///
    /// The message goes out on pub/sub and is appended to the channel's
    /// stream (the shard of `options.key` when given). A stream nobody has
    /// subscribed to yet does not exist, and the append is skipped.
    pub async fn publish(
        &self,
        channel: &str,
        content: Value,
        options: PublishOptions,
    ) -> Result<String> {
        let mut message = Message::new(content).with_headers(options.headers);
        message.reply_to = options.reply_to;
        let payload = message.pack()?;

        self.store.publish(channel, &payload).await?;

        let stream = match &options.key {
            Some(key) => shard_stream(channel, partition_for(key, self.config.shards)),
            None => channel.to_string(),
        };
        self.append(&stream, channel, &payload).await?;

        Ok(message.id)
    }

    /// Publish an event that happened to one resource.
    ///
    /// Events of the same resource land on the same shard stream, so they are
    /// consumed in order. A copy goes to `RESOURCE:{type}:{event}` on pub/sub.
    pub async fn publish_resource_event(
        &self,
        resource_type: &str,
        resource_id: &str,
        event: &str,
        payload: Value,
        headers: Headers,
    ) -> Result<String> {
        let message = Message::new(payload)
            .with_headers(headers)
            .with_header("event", event);
        let packed = message.pack()?;

        let stream = shard_stream(
            resource_type,
            partition_for(resource_id, self.config.shards),
        );
        self.append(&stream, resource_type, &packed).await?;

        let simple_channel = format!("RESOURCE:{}:{}", resource_type, event);
        self.store.publish(&simple_channel, &packed).await?;

        Ok(message.id)
    }

    /// Send a request over pub/sub and wait for the first reply
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when no reply arrives within `timeout`
    pub async fn request(
        &self,
        channel: &str,
        content: Value,
        headers: Headers,
        timeout: Duration,
    ) -> Result<Message> {
        let (reply_to, mut replies) = self.send_request(channel, content, headers).await?;

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(reply)) => Message::unpack(&reply.payload, Some(&reply_to), None),
            Ok(None) => Err(Error::Store(format!(
                "reply subscription {} closed",
                reply_to
            ))),
            Err(_) => Err(Error::Timeout(channel.to_string())),
        }
    }

    /// Send a request over pub/sub and collect every reply until `timeout`
    pub async fn request_all(
        &self,
        channel: &str,
        content: Value,
        headers: Headers,
        timeout: Duration,
    ) -> Result<Vec<Message>> {
        let (reply_to, mut replies) = self.send_request(channel, content, headers).await?;
        let deadline = tokio::time::Instant::now() + timeout;

        let mut collected = Vec::new();
        while let Ok(Some(reply)) = tokio::time::timeout_at(deadline, replies.next()).await {
            match Message::unpack(&reply.payload, Some(&reply_to), None) {
                Ok(message) => collected.push(message),
                Err(e) => warn!(reply_to = %reply_to, error = %e, "Dropping undecodable reply"),
            }
        }
        Ok(collected)
    }

    /// Answer a request received through a subscription
    pub async fn reply(&self, request: &Message, content: Value) -> Result<()> {
        let Some(reply_to) = request.reply_to.as_deref() else {
            debug!(message_id = %request.id, "Message has no reply channel");
            return Ok(());
        };
        let payload = Message::new(content).pack()?;
        self.store.publish(reply_to, &payload).await
    }

    /// Subscribe to a fresh reply channel, then publish the request
    async fn send_request(
        &self,
        channel: &str,
        content: Value,
        headers: Headers,
    ) -> Result<(String, crate::store::PubSubStream)> {
        let reply_to = format!("REPLY_TO:{}", Uuid::new_v4().simple());
        let replies = self.store.subscribe(&[reply_to.clone()]).await?;

        let message = Message::new(content)
            .with_headers(headers)
            .with_reply_to(reply_to.clone());
        self.store.publish(channel, &message.pack()?).await?;

        Ok((reply_to, replies))
    }

    async fn append(&self, stream: &str, channel: &str, payload: &[u8]) -> Result<()> {
        let maxlen = self.config.maxlen_for(channel);
        if self.store.append(stream, payload, maxlen).await?.is_none() {
            debug!(stream, "Stream has no consumer group yet, entry skipped");
        }
        Ok(())
    }
}
