//! Named integer counters shared by every instance
//!
//! Counters live under an optional key prefix. An increment can refresh the
//! counter's expiry, which turns it into a rolling window (rate limits,
//! daily quotas).

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::store::{prefixed_key, Store};

/// Distributed counter namespace
pub struct Counter {
    store: Arc<dyn Store>,
    key_prefix: String,
}

impl Counter {
    /// Create a counter namespace; an empty prefix leaves names untouched
    pub fn new(store: Arc<dyn Store>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        prefixed_key(&[&self.key_prefix, name])
    }

    /// Add `amount` and return the new value. A missing counter starts at 0.
    ///
    /// With `ttl`, the counter expires that long after this call.
    pub async fn increment(&self, name: &str, amount: i64, ttl: Option<Duration>) -> Result<i64> {
        self.store.incr_by(&self.key(name), amount, ttl).await
    }

    /// Subtract `amount` and return the new value
    pub async fn decrement(&self, name: &str, amount: i64, ttl: Option<Duration>) -> Result<i64> {
        let amount = amount
            .checked_neg()
            .ok_or_else(|| Error::Store(format!("cannot decrement {} by {}", name, amount)))?;
        self.increment(name, amount, ttl).await
    }

    /// Current value, `None` when the counter does not exist
    pub async fn get(&self, name: &str) -> Result<Option<i64>> {
        let key = self.key(name);
        match self.store.get(&key).await? {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| Error::Store(format!("counter {} holds {:?}", key, value))),
            None => Ok(None),
        }
    }

    /// Overwrite the value
    pub async fn set(&self, name: &str, value: i64, ttl: Option<Duration>) -> Result<()> {
        let key = self.key(name);
        match ttl {
            Some(ttl) => self.store.set_ex(&key, &value.to_string(), ttl).await,
            None => self.store.set(&key, &value.to_string()).await,
        }
    }

    /// Remove the counter; true when it existed
    pub async fn delete(&self, name: &str) -> Result<bool> {
        self.store.delete(&self.key(name)).await
    }

    /// Whether the counter exists
    pub async fn exists(&self, name: &str) -> Result<bool> {
        self.store.exists(&self.key(name)).await
    }
}
