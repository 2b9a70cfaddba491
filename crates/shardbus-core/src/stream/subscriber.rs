//! Sharded stream subscriber
//!
//! Every instance of a service subscribes to the same channels under one
//! consumer group (the service name). Each channel is split into shard streams
//! `channel$0..channel$N-1`; an instance only reads the shards it currently
//! holds a lock on, so a keyed message is handled by exactly one instance and
//! messages of one key are handled in order.
//!
//! One loop iteration:
//!
//! 1. lock every free shard of the subscribed channels
//! 2. blocking read (NOACK) on the base channels plus the locked shards
//! 3. release the locks of shards that produced nothing
//! 4. dispatch every entry to the channel's handlers
//! 5. release the remaining locks
//!
//! The block time adapts to traffic, see [`BlockTime`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::block_time::BlockTime;
use super::shard_lock::ShardLockCoordinator;
use super::{MessageHandler, Routes};
use crate::codec::Message;
use crate::config::SubscriberConfig;
use crate::error::{Error, Result};
use crate::store::{liveness_key, shard_stream, split_shard_stream, GroupRead, StreamBatch, Store};

/// How often the liveness key is refreshed
const LIVENESS_REFRESH: Duration = Duration::from_secs(15);

/// Liveness key expiry; an instance silent for this long loses its shard locks
const LIVENESS_TTL: Duration = Duration::from_secs(30);

const STOPPED: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const STOPPING: u8 = 3;

/// Subscriber lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Not reading; subscriptions may change
    Stopped,
    /// Creating consumer groups
    Starting,
    /// Read loop active
    Running,
    /// Waiting for the read loop to finish its iteration, or for an
    /// interrupted start to unwind
    Stopping,
}

impl SubscriberState {
    fn from_u8(value: u8) -> Self {
        match value {
            STARTING => Self::Starting,
            RUNNING => Self::Running,
            STOPPING => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Shared by the subscriber handle and its background tasks
struct ReadLoop {
    store: Arc<dyn Store>,
    locks: ShardLockCoordinator,
    config: SubscriberConfig,
    consumer_group: String,
    consumer_id: String,
    liveness_key: String,
}

/// Sharded consumer-group subscriber
pub struct StreamSubscriber {
    core: Arc<ReadLoop>,
    routes: Mutex<Routes>,
    state: AtomicU8,
    cancel: Mutex<CancellationToken>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Signalled when an interrupted start has unwound to `Stopped`
    start_aborted: Notify,
}

impl StreamSubscriber {
    /// Create a stopped subscriber
    ///
    /// # Errors
    ///
    /// Returns error if the configuration or shard count is invalid
    pub fn new(
        store: Arc<dyn Store>,
        config: SubscriberConfig,
        lock_prefix: impl Into<String>,
        consumer_group: impl Into<String>,
        consumer_id: impl Into<String>,
        shard_count: u32,
    ) -> Result<Self> {
        config.validate()?;
        let lock_prefix = lock_prefix.into();
        let consumer_group = consumer_group.into();
        let consumer_id = consumer_id.into();

        let locks = ShardLockCoordinator::new(
            store.clone(),
            lock_prefix.clone(),
            consumer_group.clone(),
            consumer_id.clone(),
            shard_count,
        )?;

        Ok(Self {
            core: Arc::new(ReadLoop {
                store,
                locks,
                config,
                liveness_key: liveness_key(&lock_prefix, &consumer_id),
                consumer_group,
                consumer_id,
            }),
            routes: Mutex::new(Routes::default()),
            state: AtomicU8::new(STOPPED),
            cancel: Mutex::new(CancellationToken::new()),
            workers: Mutex::new(Vec::new()),
            start_aborted: Notify::new(),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Channels registered so far
    pub fn channels(&self) -> Vec<String> {
        lock_unpoisoned(&self.routes).channels().to_vec()
    }

    /// Register `handler` for `channel`. Only allowed while stopped.
    pub fn subscribe(&self, channel: impl Into<String>, handler: MessageHandler) -> Result<()> {
        let channel = channel.into();
        if self.state() != SubscriberState::Stopped {
            return Err(Error::AlreadyRunning(channel));
        }

        lock_unpoisoned(&self.routes).add(channel, handler);
        Ok(())
    }

    /// Create consumer groups and spawn the read and liveness loops.
    ///
    /// Starting an already started subscriber is a no-op. A [`stop`](Self::stop)
    /// issued while groups are being created wins: the loops are torn down
    /// and the subscriber ends up stopped.
    pub async fn start(&self) -> Result<()> {
        if !self.cas(STOPPED, STARTING) {
            debug!(consumer = %self.core.consumer_id, "Subscriber already started");
            return Ok(());
        }

        let routes = Arc::new(lock_unpoisoned(&self.routes).clone());
        if routes.is_empty() {
            if !self.cas(STARTING, RUNNING) {
                self.abort_start();
            }
            return Ok(());
        }

        if let Err(e) = self.core.create_groups(routes.channels()).await {
            self.abort_start();
            return Err(e);
        }
        if self.state.load(Ordering::SeqCst) == STOPPING {
            info!(consumer = %self.core.consumer_id, "Stop requested while starting");
            self.abort_start();
            return Ok(());
        }

        // Mark ourselves alive before holding any lock, or peers would take them over
        if let Err(e) = self.core.touch_liveness().await {
            warn!(consumer = %self.core.consumer_id, error = %e, "Failed to set liveness key");
        }

        let token = CancellationToken::new();
        *lock_unpoisoned(&self.cancel) = token.clone();

        let reader = tokio::spawn(self.core.clone().run(routes.clone(), token.clone()));
        let liveness = tokio::spawn(self.core.clone().keep_alive(token.clone()));
        lock_unpoisoned(&self.workers).extend([reader, liveness]);

        if !self.cas(STARTING, RUNNING) {
            info!(consumer = %self.core.consumer_id, "Stop requested while starting");
            token.cancel();
            self.join_workers().await;
            self.abort_start();
            return Ok(());
        }
        info!(
            consumer_group = %self.core.consumer_group,
            consumer = %self.core.consumer_id,
            channels = ?routes.channels(),
            "Stream subscriber started"
        );
        Ok(())
    }

    /// Stop the loops and wait for the current iteration to finish.
    ///
    /// Idempotent; calling it on a stopped subscriber returns immediately.
    /// During a start it waits for the start to unwind instead.
    pub async fn stop(&self) {
        loop {
            match self.state.load(Ordering::SeqCst) {
                RUNNING => {
                    if self.cas(RUNNING, STOPPING) {
                        break;
                    }
                }
                STARTING => {
                    if self.cas(STARTING, STOPPING) {
                        self.wait_start_aborted().await;
                        return;
                    }
                }
                _ => return,
            }
        }

        lock_unpoisoned(&self.cancel).cancel();
        self.join_workers().await;

        self.state.store(STOPPED, Ordering::SeqCst);
        info!(consumer = %self.core.consumer_id, "Stream subscriber stopped");
    }

    fn cas(&self, current: u8, new: u8) -> bool {
        self.state
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    async fn join_workers(&self) {
        let workers: Vec<JoinHandle<()>> = lock_unpoisoned(&self.workers).drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(consumer = %self.core.consumer_id, error = %e, "Subscriber task failed");
            }
        }
    }

    /// Settle an unfinished start back to `Stopped` and wake a waiting `stop()`
    fn abort_start(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
        self.start_aborted.notify_waiters();
    }

    async fn wait_start_aborted(&self) {
        let aborted = self.start_aborted.notified();
        tokio::pin!(aborted);
        // Register before checking, so a notification in between is not missed
        aborted.as_mut().enable();
        if self.state.load(Ordering::SeqCst) != STOPPED {
            aborted.await;
        }
    }

    /// Run a single loop iteration; used by tests to drive the loop step by step
    #[cfg(test)]
    pub(crate) async fn run_once(&self, block: &mut BlockTime) -> Result<usize> {
        let routes = lock_unpoisoned(&self.routes).clone();
        let token = CancellationToken::new();
        let result = self.core.iterate(&routes, block, &token).await;
        self.core.locks.release_all(routes.channels()).await?;
        result
    }
}

impl ReadLoop {
    /// Groups on the base stream and every shard stream of each channel
    async fn create_groups(&self, channels: &[String]) -> Result<()> {
        for channel in channels {
            self.store.create_group(channel, &self.consumer_group).await?;
            for shard in 0..self.locks.shard_count() {
                self.store
                    .create_group(&shard_stream(channel, shard), &self.consumer_group)
                    .await?;
            }
        }
        Ok(())
    }

    async fn touch_liveness(&self) -> Result<()> {
        self.store
            .set_ex(&self.liveness_key, "1", LIVENESS_TTL)
            .await
    }

    async fn keep_alive(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(LIVENESS_REFRESH);
        // The first tick completes immediately; start() already set the key
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.touch_liveness().await {
                        warn!(consumer = %self.consumer_id, error = %e, "Failed to refresh liveness key");
                    }
                }
            }
        }
    }

    async fn run(self: Arc<Self>, routes: Arc<Routes>, cancel: CancellationToken) {
        let mut block = BlockTime::new(&self.config);

        while !cancel.is_cancelled() {
            match self.iterate(&routes, &mut block, &cancel).await {
                Ok(delivered) => {
                    trace!(consumer = %self.consumer_id, delivered, block_time = block.seconds(), "Iteration done");
                }
                Err(e) if e.is_transient() => {
                    warn!(consumer = %self.consumer_id, error = %e, "Transient store error in read loop");
                }
                Err(e) => {
                    error!(consumer = %self.consumer_id, error = %e, "Read loop iteration failed");
                }
            }

            // Never carry a lock into the next iteration, whatever happened above
            if let Err(e) = self.locks.release_all(routes.channels()).await {
                warn!(consumer = %self.consumer_id, error = %e, "Failed to release shard locks");
            }
        }

        debug!(consumer = %self.consumer_id, "Read loop exited");
    }

    /// One lock → read → release-idle → dispatch pass; returns how many
    /// messages reached the handler
    async fn iterate(
        &self,
        routes: &Routes,
        block: &mut BlockTime,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let channels = routes.channels();
        let masks = self.locks.acquire(channels).await?;

        let mut streams: Vec<String> = channels.to_vec();
        streams.extend(self.locks.locked_streams(&masks));

        if streams.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(block.duration()) => {}
            }
            return Ok(0);
        }

        let read = GroupRead {
            group: &self.consumer_group,
            consumer: &self.consumer_id,
            streams: &streams,
            count: self.config.max_messages_count,
            block: block.duration(),
        };

        let batches = match self.store.read_group(&read).await {
            Ok(batches) => batches,
            Err(Error::NoGroup(stream)) => {
                debug!(stream = %stream, "Consumer group missing, creating");
                self.create_groups(channels).await?;
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        if batches.is_empty() {
            block.grow();
            return Ok(0);
        }
        block.shrink();

        let active: Vec<&str> = batches.iter().map(|b| b.stream.as_str()).collect();
        if let Err(e) = self.locks.release_idle(channels, &active).await {
            warn!(consumer = %self.consumer_id, error = %e, "Failed to release idle shards");
        }

        let mut delivered = 0;
        for batch in batches {
            delivered += self.process(routes, batch).await;
        }
        Ok(delivered)
    }

    async fn process(&self, routes: &Routes, batch: StreamBatch) -> usize {
        let (channel, _) = split_shard_stream(&batch.stream);
        let mut delivered = 0;

        for entry in batch.entries {
            let message =
                match Message::unpack(&entry.payload, Some(channel), Some(&self.consumer_group)) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(stream = %batch.stream, entry_id = %entry.id, error = %e, "Dropping undecodable entry");
                        continue;
                    }
                };

            routes.deliver(channel, message).await;
            delivered += 1;
        }
        delivered
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
