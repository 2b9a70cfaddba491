//! Distributed mutex on top of the store
//!
//! A lock is a key holding a random token. Release and renewal only touch the
//! key while it still holds the caller's token, so a lock that expired and was
//! taken by someone else is never released by its former owner.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, trace};

use crate::error::Result;
use crate::store::{prefixed_key, Store};

/// Interval between acquisition attempts
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Distributed lock handle
pub struct DistributedLock {
    store: Arc<dyn Store>,
    key_prefix: String,
}

impl DistributedLock {
    /// Create a lock namespace; an empty prefix leaves keys untouched
    pub fn new(store: Arc<dyn Store>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        prefixed_key(&[&self.key_prefix, key])
    }

    /// Try to take `key` for `ttl`, retrying until `acquire_timeout` elapses.
    ///
    /// Returns the owner token on success, `None` if the lock stayed taken.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        acquire_timeout: Duration,
    ) -> Result<Option<String>> {
        let full_key = self.key(key);
        let token = random_token();
        let deadline = tokio::time::Instant::now() + acquire_timeout;

        loop {
            if self.store.set_nx(&full_key, &token, ttl).await? {
                trace!(key = %full_key, "Lock acquired");
                return Ok(Some(token));
            }
            if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
                debug!(key = %full_key, "Lock acquisition timed out");
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Release `key` if `token` still owns it
    pub async fn release(&self, key: &str, token: &str) -> Result<bool> {
        self.store.delete_if_owner(&self.key(key), token).await
    }

    /// Extend `key` to `ttl` if `token` still owns it
    pub async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.store.expire_if_owner(&self.key(key), token, ttl).await
    }
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn lock(store: &Arc<MemoryStore>) -> DistributedLock {
        DistributedLock::new(store.clone(), "LOCKS")
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let locks = lock(&store);

        let token = locks
            .acquire("job", Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap();
        assert!(token.is_some());

        let second = locks
            .acquire("job", Duration::from_secs(5), Duration::from_millis(30))
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(store.get("LOCKS:job").await.unwrap(), token);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(lock(&store));
        let token = locks
            .acquire("job", Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let releaser = locks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            releaser.release("job", &token).await.unwrap();
        });

        let next = locks
            .acquire("job", Duration::from_secs(5), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn test_release_and_renew_check_owner() {
        let store = Arc::new(MemoryStore::new());
        let locks = lock(&store);
        let token = locks
            .acquire("job", Duration::from_millis(50), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        assert!(!locks.release("job", "not-the-owner").await.unwrap());
        assert!(!locks
            .renew("job", "not-the-owner", Duration::from_secs(5))
            .await
            .unwrap());

        assert!(locks.renew("job", &token, Duration::from_secs(5)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(locks.release("job", &token).await.unwrap());
        assert!(!locks.release("job", &token).await.unwrap());
    }

    #[test]
    fn test_key_skips_empty_prefix() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        assert_eq!(DistributedLock::new(store.clone(), "").key("job"), "job");
        assert_eq!(DistributedLock::new(store, "A").key("job"), "A:job");
    }
}
