//! Service instance
//!
//! Wires the store, the event manager and the periodic scheduler together
//! and runs them until a shutdown signal arrives.

mod config;
mod loader;

pub use config::{AppConfig, StoreBackend};
pub use loader::load_config;

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use shardbus_core::periodic::{task_fn, PeriodicError};
use shardbus_core::{
    handler, EventManager, MemoryStore, PublishOptions, RedisStore, Store, StoreLocker, Task,
    TaskScheduler,
};
use tracing::{info, warn};

/// Build the configured store backend
fn build_store(config: &AppConfig) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.store.backend {
        StoreBackend::Redis => Arc::new(
            RedisStore::new(&config.store.url)
                .with_context(|| format!("Invalid Redis URL: {}", config.store.url))?,
        ),
        StoreBackend::Memory => {
            warn!("Using in-memory store; messages are not shared between processes");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

/// Run a service instance until Ctrl+C or SIGTERM
pub async fn run(config: AppConfig) -> Result<()> {
    let service_id = config.service.instance_id();
    info!(
        service = %config.service.name,
        instance = %service_id,
        backend = ?config.store.backend,
        "Starting shardbus v{}",
        env!("CARGO_PKG_VERSION")
    );

    let store = build_store(&config)?;
    let events = Arc::new(
        EventManager::new(
            store.clone(),
            config.events.clone(),
            config.service.name.clone(),
            service_id.clone(),
        )
        .context("Failed to create event manager")?,
    );
    register_subscriptions(&events, &config)?;
    events.start().await.context("Failed to start event manager")?;

    let locker = Arc::new(StoreLocker::new(
        store,
        &config.periodic,
        config.service.name.clone(),
        service_id.clone(),
    ));
    let scheduler = match TaskScheduler::start(locker, &config.periodic) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            events.stop().await;
            return Err(e).context("Failed to start task scheduler");
        }
    };
    if config.heartbeat.enabled {
        scheduler.add_task(heartbeat_task(&events, &config)?);
    }

    info!("Service running. Press Ctrl+C to stop.");
    wait_for_shutdown_signal().await;

    info!("Shutting down...");
    scheduler.stop().await;
    events.stop().await;
    info!("Shutdown complete");
    Ok(())
}

/// Publish a single message using the configured store
pub async fn publish(
    config: &AppConfig,
    channel: &str,
    content: Value,
    options: PublishOptions,
) -> Result<String> {
    let store = build_store(config)?;
    let events = EventManager::new(
        store,
        config.events.clone(),
        config.service.name.clone(),
        config.service.instance_id(),
    )?;
    let id = events
        .publish(channel, content, options)
        .await
        .with_context(|| format!("Failed to publish on {}", channel))?;
    Ok(id)
}

fn register_subscriptions(events: &Arc<EventManager>, config: &AppConfig) -> Result<()> {
    use shardbus_core::SubscriptionMode::{Broadcast, Command, Consumer};

    for channel in &config.subscriptions.consumer {
        events.subscribe(channel.clone(), Consumer, log_handler("consumer"))?;
    }
    for channel in &config.subscriptions.broadcast {
        events.subscribe(channel.clone(), Broadcast, log_handler("broadcast"))?;
    }
    for channel in &config.subscriptions.command {
        let weak: Weak<EventManager> = Arc::downgrade(events);
        events.subscribe(
            channel.clone(),
            Command,
            handler(move |channel, message| {
                let weak = weak.clone();
                async move {
                    info!(channel = %channel, message_id = %message.id, "Command received");
                    let Some(events) = weak.upgrade() else {
                        return Ok(());
                    };
                    let ack = json!({
                        "ack": message.id,
                        "service": events.service_name(),
                        "instance": events.service_id(),
                    });
                    events.reply(&message, ack).await
                }
            }),
        )?;
    }
    Ok(())
}

fn log_handler(mode: &'static str) -> shardbus_core::MessageHandler {
    handler(move |channel, message| async move {
        info!(
            mode,
            channel = %channel,
            message_id = %message.id,
            content = %message.content,
            "Message received"
        );
        Ok(())
    })
}

fn heartbeat_task(events: &Arc<EventManager>, config: &AppConfig) -> Result<Task> {
    let events = events.clone();
    let channel = config.heartbeat.channel.clone();
    let body = task_fn(move || {
        let events = events.clone();
        let channel = channel.clone();
        async move {
            let content = json!({
                "service": events.service_name(),
                "instance": events.service_id(),
                "at": shardbus_core::periodic::now(),
            });
            events
                .publish(&channel, content, PublishOptions::new())
                .await
                .map(|_| ())
                .map_err(PeriodicError::from)
        }
    });
    let task = Task::every(
        "heartbeat",
        config.heartbeat.period_secs,
        config.heartbeat.per_service,
        body,
    )?;
    Ok(task)
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn memory_config() -> AppConfig {
        let mut config: AppConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(
                loader::DEFAULT_CONFIG,
                ::config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        config.store.backend = StoreBackend::Memory;
        config
    }

    #[tokio::test]
    async fn test_command_subscription_replies_with_ack() {
        let mut config = memory_config();
        config.subscriptions.command = vec!["ops".to_string()];
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

        let server = Arc::new(
            EventManager::new(store.clone(), config.events.clone(), "ops-svc", "ops-1").unwrap(),
        );
        register_subscriptions(&server, &config).unwrap();
        server.start().await.unwrap();

        let client = EventManager::new(store, config.events.clone(), "client", "c-1").unwrap();
        let reply = client
            .request(
                "ops",
                json!({"do": "ping"}),
                Default::default(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(reply.content["service"], "ops-svc");
        assert_eq!(reply.content["instance"], "ops-1");

        server.stop().await;
    }

    #[test]
    fn test_heartbeat_task_is_scheduled_ahead() {
        let mut config = memory_config();
        config.heartbeat.period_secs = 5.0;
        config.heartbeat.per_service = true;
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let events =
            Arc::new(EventManager::new(store, config.events.clone(), "svc", "svc-1").unwrap());

        let task = heartbeat_task(&events, &config).unwrap();
        assert_eq!(task.name(), "heartbeat");
        assert!(task.per_service());
        let ahead = task.at_time() - shardbus_core::periodic::now();
        assert!(ahead > 0.0 && ahead <= 5.0 + 1e-3);
    }
}
