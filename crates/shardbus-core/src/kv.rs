//! Shared key-value store
//!
//! Plain string values under an optional key prefix, visible to every
//! instance that uses the same prefix.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::Result;
use crate::store::{prefixed_key, Store};

/// Prefixed key-value namespace
pub struct KvStore {
    store: Arc<dyn Store>,
    key_prefix: String,
}

impl KvStore {
    /// Create a namespace; an empty prefix leaves keys untouched
    pub fn new(store: Arc<dyn Store>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        prefixed_key(&[&self.key_prefix, key])
    }

    /// Value of `key`
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.store.get(&self.key(key)).await
    }

    /// Store `value`, expiring after `ttl` when given
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let key = self.key(key);
        match ttl {
            Some(ttl) => self.store.set_ex(&key, value, ttl).await,
            None => self.store.set(&key, value).await,
        }
    }

    /// Remove `key`; true when it existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.store.delete(&self.key(key)).await
    }

    /// Remove every key of the namespace.
    ///
    /// Without a prefix the namespace is the whole store, so everything goes.
    pub async fn clear_all(&self) -> Result<usize> {
        let prefix = if self.key_prefix.is_empty() {
            String::new()
        } else {
            format!("{}:", self.key_prefix)
        };
        let removed = self.store.delete_prefix(&prefix).await?;
        info!(prefix = %self.key_prefix, removed, "Key-value namespace cleared");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = Arc::new(MemoryStore::new());
        let kv = KvStore::new(store.clone(), "my_prefix");

        store.set("my_prefix:foo", "bar").await.unwrap();
        assert_eq!(kv.get("foo").await.unwrap().as_deref(), Some("bar"));

        kv.set("baz", "qux", None).await.unwrap();
        assert_eq!(store.get("my_prefix:baz").await.unwrap().as_deref(), Some("qux"));

        assert!(kv.delete("foo").await.unwrap());
        assert_eq!(store.get("my_prefix:foo").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_with_ttl_expires() {
        let store = Arc::new(MemoryStore::new());
        let kv = KvStore::new(store, "");

        kv.set("session", "token", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(kv.get("session").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("session").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_all_keeps_other_namespaces() {
        let store = Arc::new(MemoryStore::new());
        let kv = KvStore::new(store.clone(), "my_prefix");

        kv.set("foo", "bar", None).await.unwrap();
        kv.set("baz", "qux", None).await.unwrap();
        store.set("other:foo", "bar").await.unwrap();
        store.set("my_prefixed", "x").await.unwrap();

        assert_eq!(kv.clear_all().await.unwrap(), 2);
        assert_eq!(kv.get("foo").await.unwrap(), None);
        assert_eq!(store.get("other:foo").await.unwrap().as_deref(), Some("bar"));
        assert_eq!(store.get("my_prefixed").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_empty_prefix_uses_raw_keys() {
        let store = Arc::new(MemoryStore::new());
        let kv = KvStore::new(store.clone(), "");

        kv.set("foo", "bar", None).await.unwrap();
        assert_eq!(store.get("foo").await.unwrap().as_deref(), Some("bar"));
        store.set("baz", "qux").await.unwrap();

        assert_eq!(kv.clear_all().await.unwrap(), 2);
        assert!(!store.exists("baz").await.unwrap());
    }
}
