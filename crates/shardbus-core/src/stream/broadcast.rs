//! Broadcast subscriber over pub/sub
//!
//! Every instance receives every message. Channels subscribed with a lock
//! process each message on a single instance: whoever first sets the
//! per-message lock key wins, the others skip it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{MessageHandler, Routes};
use crate::codec::Message;
use crate::error::{Error, Result};
use crate::store::{PubSubMessage, PubSubStream, Store};

/// Delay before resubscribing after the pub/sub connection drops
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Expiry of a per-message lock
const MESSAGE_LOCK_TTL: Duration = Duration::from_secs(600);

struct Dispatcher {
    store: Arc<dyn Store>,
    lock_prefix: String,
    service_name: String,
    service_id: String,
    routes: Routes,
    locked: HashSet<String>,
}

/// Fan-out subscriber; see the module docs
pub struct BroadcastSubscriber {
    store: Arc<dyn Store>,
    lock_prefix: String,
    service_name: String,
    service_id: String,
    routes: Mutex<Routes>,
    locked: Mutex<HashSet<String>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastSubscriber {
    /// Create a stopped subscriber
    pub fn new(
        store: Arc<dyn Store>,
        lock_prefix: impl Into<String>,
        service_name: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            lock_prefix: lock_prefix.into(),
            service_name: service_name.into(),
            service_id: service_id.into(),
            routes: Mutex::new(Routes::default()),
            locked: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            worker: Mutex::new(None),
        }
    }

    /// Register `handler` for `channel`.
    ///
    /// With `lock`, a message is handled by one instance of the service only.
    pub fn subscribe(
        &self,
        channel: impl Into<String>,
        lock: bool,
        handler: MessageHandler,
    ) -> Result<()> {
        let channel = channel.into();
        if self.is_running() {
            return Err(Error::AlreadyRunning(channel));
        }

        if lock {
            lock_unpoisoned(&self.locked).insert(channel.clone());
        }
        lock_unpoisoned(&self.routes).add(channel, handler);
        Ok(())
    }

    /// Whether the receive loop is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe and spawn the receive loop. Returns once the subscription is active.
    pub async fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let dispatcher = Arc::new(Dispatcher {
            store: self.store.clone(),
            lock_prefix: self.lock_prefix.clone(),
            service_name: self.service_name.clone(),
            service_id: self.service_id.clone(),
            routes: lock_unpoisoned(&self.routes).clone(),
            locked: lock_unpoisoned(&self.locked).clone(),
        });
        if dispatcher.routes.is_empty() {
            return Ok(());
        }

        let messages = match self.store.subscribe(dispatcher.routes.channels()).await {
            Ok(messages) => messages,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        *lock_unpoisoned(&self.cancel) = token.clone();
        let worker = tokio::spawn(dispatcher.clone().run(messages, token));
        *lock_unpoisoned(&self.worker) = Some(worker);

        info!(
            service = %self.service_name,
            channels = ?dispatcher.routes.channels(),
            "Broadcast subscriber started"
        );
        Ok(())
    }

    /// Stop the receive loop. Idempotent.
    pub async fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        lock_unpoisoned(&self.cancel).cancel();
        let worker = lock_unpoisoned(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(service = %self.service_name, error = %e, "Broadcast task failed");
            }
        }
        debug!(service = %self.service_name, "Broadcast subscriber stopped");
    }
}

impl Dispatcher {
    async fn run(self: Arc<Self>, mut messages: PubSubStream, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = messages.next() => match next {
                    Some(message) => self.handle(message).await,
                    None => {
                        warn!(service = %self.service_name, "Pub/sub connection lost, resubscribing");
                        match self.resubscribe(&cancel).await {
                            Some(fresh) => messages = fresh,
                            None => break,
                        }
                    }
                },
            }
        }
    }

    /// Retry the subscription until it succeeds or the loop is cancelled
    async fn resubscribe(&self, cancel: &CancellationToken) -> Option<PubSubStream> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }

            match self.store.subscribe(self.routes.channels()).await {
                Ok(messages) => return Some(messages),
                Err(e) => warn!(service = %self.service_name, error = %e, "Resubscribe failed"),
            }
        }
    }

    async fn handle(&self, delivery: PubSubMessage) {
        let channel = delivery.channel.as_str();
        let message = match Message::unpack(&delivery.payload, Some(channel), None) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel, error = %e, "Dropping undecodable broadcast");
                return;
            }
        };

        if self.locked.contains(channel) {
            match self.claim(channel, &message.id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(channel, message_id = %message.id, "Message claimed by another instance");
                    return;
                }
                Err(e) => {
                    warn!(channel, message_id = %message.id, error = %e, "Failed to claim message");
                    return;
                }
            }
        }

        self.routes.deliver(channel, message).await;
    }

    /// Take the per-message lock for this instance
    async fn claim(&self, channel: &str, message_id: &str) -> Result<bool> {
        let key = format!(
            "{}:SIMPLE:LOCK:{}:{}:{}",
            self.lock_prefix, channel, self.service_name, message_id
        );
        if !self
            .store
            .set_nx(&key, &self.service_id, MESSAGE_LOCK_TTL)
            .await?
        {
            return Ok(false);
        }
        Ok(self.store.get(&key).await?.as_deref() == Some(self.service_id.as_str()))
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
