//! Cache adapter for keyed, selector-scoped entries
//!
//! An entry lives at `{prefix}:{key}:{selector}`. A key groups related
//! entries (one per query or projection), so all of them can be flushed
//! together with the `*` selector.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::store::Store;

/// Prefix used when none is configured
pub const DEFAULT_CACHE_PREFIX: &str = "SHARDBUS:CACHE";

/// Selector matching every entry of a key in [`CacheAdapter::flush`]
pub const ALL_SELECTORS: &str = "*";

/// Selector-scoped cache over the store
pub struct CacheAdapter {
    store: Arc<dyn Store>,
    key_prefix: String,
}

impl CacheAdapter {
    /// Cache under [`DEFAULT_CACHE_PREFIX`]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_prefix(store, DEFAULT_CACHE_PREFIX)
    }

    /// Cache under `key_prefix`
    pub fn with_prefix(store: Arc<dyn Store>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    fn entry_key(&self, key: &str, selector: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, key, selector)
    }

    /// Cached data, `None` on a miss
    pub async fn fetch(&self, key: &str, selector: &str) -> Result<Option<String>> {
        self.store.get(&self.entry_key(key, selector)).await
    }

    /// Store `data`, expiring after `ttl` when given
    pub async fn cache(
        &self,
        key: &str,
        selector: &str,
        data: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let entry = self.entry_key(key, selector);
        match ttl {
            Some(ttl) => self.store.set_ex(&entry, data, ttl).await,
            None => self.store.set(&entry, data).await,
        }
    }

    /// Drop one entry; true when it existed
    pub async fn remove(&self, key: &str, selector: &str) -> Result<bool> {
        self.store.delete(&self.entry_key(key, selector)).await
    }

    /// Drop the listed selectors of `key`; [`ALL_SELECTORS`] drops them all.
    /// Returns how many entries went away.
    pub async fn flush(&self, key: &str, selectors: &[&str]) -> Result<usize> {
        let mut removed = 0;
        for selector in selectors {
            if *selector == ALL_SELECTORS {
                let prefix = format!("{}:{}:", self.key_prefix, key);
                removed += self.store.delete_prefix(&prefix).await?;
            } else if self.remove(key, selector).await? {
                removed += 1;
            }
        }
        debug!(key = %key, removed, "Cache flushed");
        Ok(removed)
    }
}
