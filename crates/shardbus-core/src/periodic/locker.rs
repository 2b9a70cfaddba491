//! Per-service task locks
//!
//! A per-service task must run once per occurrence across every instance of
//! the service. The [`Locker`] decides which instance claims an occurrence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::task::TaskFuture;
use super::types::Result;
use crate::config::PeriodicConfig;
use crate::store::Store;

/// Claims task occurrences
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Locker: Send + Sync {
    /// Claim the occurrence of `name` scheduled at `at`; true if this instance won
    async fn acquire(&self, name: &str, at: f64) -> Result<bool>;
}

/// Run `work` only if `locker` grants the `(name, at)` occurrence.
///
/// Returns whether the work ran.
pub async fn run_locked(
    locker: &dyn Locker,
    name: &str,
    at: f64,
    work: TaskFuture,
) -> Result<bool> {
    if !locker.acquire(name, at).await? {
        return Ok(false);
    }
    work.await?;
    Ok(true)
}

/// Grants every occurrence; for single-instance deployments and tests
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneLocker;

#[async_trait]
impl Locker for NoneLocker {
    async fn acquire(&self, _name: &str, _at: f64) -> Result<bool> {
        Ok(true)
    }
}

/// Store-backed locker: the first instance to set the occurrence key wins
pub struct StoreLocker {
    store: Arc<dyn Store>,
    prefix: String,
    service_name: String,
    service_id: String,
    ttl: Duration,
}

impl StoreLocker {
    /// Create a locker for one service instance
    pub fn new(
        store: Arc<dyn Store>,
        config: &PeriodicConfig,
        service_name: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            prefix: config.lock_prefix.clone(),
            service_name: service_name.into(),
            service_id: service_id.into(),
            ttl: config.lock_ttl(),
        }
    }

    /// `{prefix}:{service}:{task}:{at}`; `at` keeps its float form
    /// (`1700000060.0`, `1700000060.25`) to match keys written by other
    /// instances of the service
    fn key(&self, name: &str, at: f64) -> String {
        format!("{}:{}:{}:{:?}", self.prefix, self.service_name, name, at)
    }
}

#[async_trait]
impl Locker for StoreLocker {
    async fn acquire(&self, name: &str, at: f64) -> Result<bool> {
        let key = self.key(name, at);
        self.store.set_nx(&key, &self.service_id, self.ttl).await?;
        let owner = self.store.get(&key).await?;
        let won = owner.as_deref() == Some(self.service_id.as_str());
        trace!(key = %key, won, "Task occurrence lock");
        Ok(won)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn locker(store: &Arc<MemoryStore>, id: &str) -> StoreLocker {
        StoreLocker::new(store.clone(), &PeriodicConfig::default(), "billing", id)
    }

    #[tokio::test]
    async fn test_store_locker_grants_each_occurrence_once() {
        let store = Arc::new(MemoryStore::new());
        let a = locker(&store, "a");
        let b = locker(&store, "b");

        assert!(a.acquire("report", 1_700_000_000.0).await.unwrap());
        assert!(!b.acquire("report", 1_700_000_000.0).await.unwrap());
        // Same instance asking again still owns it
        assert!(a.acquire("report", 1_700_000_000.0).await.unwrap());

        // Next occurrence is a different key
        assert!(b.acquire("report", 1_700_000_060.0).await.unwrap());
        assert_eq!(
            store
                .get("SHARDBUS:PERIODIC:LOCK:billing:report:1700000060.0")
                .await
                .unwrap()
                .as_deref(),
            Some("b")
        );
    }

    #[test]
    fn test_occurrence_key_keeps_float_form() {
        let store = Arc::new(MemoryStore::new());
        let a = locker(&store, "a");
        assert_eq!(
            a.key("report", 1_700_000_060.0),
            "SHARDBUS:PERIODIC:LOCK:billing:report:1700000060.0"
        );
        assert_eq!(
            a.key("report", 1_700_000_060.25),
            "SHARDBUS:PERIODIC:LOCK:billing:report:1700000060.25"
        );
    }

    #[tokio::test]
    async fn test_run_locked_skips_denied_work() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut denied = MockLocker::new();
        denied.expect_acquire().times(1).returning(|_, _| Ok(false));

        let counter = ran.clone();
        let work: TaskFuture = Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(!run_locked(&denied, "job", 1.0, work).await.unwrap());
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        let counter = ran.clone();
        let work: TaskFuture = Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(run_locked(&NoneLocker, "job", 1.0, work).await.unwrap());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
