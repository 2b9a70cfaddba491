//! Service configuration types

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use shardbus_core::{EventManagerConfig, PeriodicConfig};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub events: EventManagerConfig,
    #[serde(default)]
    pub periodic: PeriodicConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl AppConfig {
    /// Check every section
    pub fn validate(&self) -> Result<()> {
        if self.service.name.is_empty() {
            bail!("service.name must not be empty");
        }
        self.events.validate()?;
        self.periodic.validate()?;
        if self.heartbeat.enabled && !(self.heartbeat.period_secs > 0.0) {
            bail!("heartbeat.period_secs must be positive");
        }
        Ok(())
    }
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name; instances of one service share stream consumption
    pub name: String,
    /// Instance id; generated from the hostname when absent
    #[serde(default)]
    pub id: Option<String>,
}

impl ServiceConfig {
    /// Configured instance id, or `{hostname}-{random}`
    pub fn instance_id(&self) -> String {
        if let Some(id) = self.id.as_ref().filter(|id| !id.is_empty()) {
            return id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "shardbus".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", host, &suffix[..8])
    }
}

/// Backing store selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// In-process store; single instance only
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub url: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
        }
    }
}

/// Channels this instance listens on, per mode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionsConfig {
    #[serde(default)]
    pub consumer: Vec<String>,
    #[serde(default)]
    pub broadcast: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
}

/// Periodic heartbeat publication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_channel")]
    pub channel: String,
    #[serde(default = "default_heartbeat_period")]
    pub period_secs: f64,
    /// Publish once per service rather than once per instance
    #[serde(default)]
    pub per_service: bool,
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_channel() -> String {
    "heartbeat".to_string()
}

fn default_heartbeat_period() -> f64 {
    60.0
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            channel: default_heartbeat_channel(),
            period_secs: default_heartbeat_period(),
            per_service: false,
        }
    }
}
