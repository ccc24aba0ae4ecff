//! # Named locks with TTL
//!
//! [`Locking`] polls a [`LockStore`] until a named key is taken or a deadline passes.
//! Keys expire on their own after the TTL so a crashed holder cannot starve others, and a
//! lease only releases the key while it is still owned by the same random token.
//!
//! A [`LockLease`] dropped without [`Locking::release`] (panic, cancelled future) hands
//! the release to a background task on the current runtime.
//!
//! Two stores ship: [`DatabaseLockStore`] (shared by every instance through the `locks`
//! table) and [`MemoryLockStore`] (single process).

mod database;
mod memory;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tokio::time::{Instant, sleep};
use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;

pub use database::DatabaseLockStore;
pub use memory::MemoryLockStore;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_POLL_JITTER_MS: u64 = 25;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms waiting for lock '{key}'")]
    Timeout { key: String, waited_ms: u128 },
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
}

/// Storage primitive behind [`Locking`]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take `key` for `owner` unless another owner holds an unexpired entry.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Drop `key` if `owner` still holds it.
    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError>;
}

/// A held lock
pub struct LockLease {
    key: String,
    owner: String,
    store: Option<Arc<dyn LockStore>>,
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("released", &self.store.is_none())
            .finish()
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);

        match Handle::try_current() {
            Ok(handle) => {
                debug!(key = %key, "Lock lease dropped while held, releasing in background");
                handle.spawn(async move {
                    if let Err(error) = store.release(&key, &owner).await {
                        warn!(key = %key, error = %error, "Failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "Lock lease dropped outside a runtime; waiting for TTL expiry");
            }
        }
    }
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[derive(Clone)]
pub struct Locking {
    store: Arc<dyn LockStore>,
    poll_interval: Duration,
}

impl std::fmt::Debug for Locking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locking")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Locking {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLockStore::new()))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// Wait up to `timeout` for `key`. A store error ends the wait immediately.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<LockLease, LockError> {
        let owner = Uuid::new_v4().to_string();
        let started = Instant::now();

        loop {
            if self.store.try_acquire(key, &owner, ttl).await? {
                debug!(key, waited_ms = started.elapsed().as_millis(), "Lock acquired");
                return Ok(LockLease {
                    key: key.to_string(),
                    owner,
                    store: Some(self.store.clone()),
                });
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited_ms: waited.as_millis(),
                });
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_POLL_JITTER_MS));
            sleep((self.poll_interval + jitter).min(timeout - waited)).await;
        }
    }

    /// Release a lease. Failures are logged; the TTL reclaims the key regardless.
    pub async fn release(&self, mut lease: LockLease) {
        lease.store = None;
        if let Err(error) = self.store.release(&lease.key, &lease.owner).await {
            warn!(key = %lease.key, error = %error, "Failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let locking = Locking::in_memory().with_poll_interval(Duration::from_millis(5));
        let lease = locking
            .acquire("k", Duration::from_secs(10), Duration::from_millis(100))
            .await
            .unwrap();

        let error = locking
            .acquire("k", Duration::from_secs(10), Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(matches!(error, LockError::Timeout { .. }));

        locking.release(lease).await;
        locking
            .acquire("k", Duration::from_secs(10), Duration::from_millis(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_key_is_reclaimed() {
        let locking = Locking::in_memory().with_poll_interval(Duration::from_millis(5));
        let _stale = locking
            .acquire("k", Duration::from_millis(20), Duration::from_millis(10))
            .await
            .unwrap();

        let lease = locking
            .acquire("k", Duration::from_secs(1), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(lease.key(), "k");
    }

    #[tokio::test]
    async fn test_waiter_gets_the_lock_after_release() {
        let locking = Locking::in_memory().with_poll_interval(Duration::from_millis(5));
        let lease = locking
            .acquire("k", Duration::from_secs(10), Duration::from_millis(50))
            .await
            .unwrap();

        let waiter = {
            let locking = locking.clone();
            tokio::spawn(async move {
                locking
                    .acquire("k", Duration::from_secs(10), Duration::from_secs(2))
                    .await
            })
        };

        sleep(Duration::from_millis(30)).await;
        locking.release(lease).await;
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_the_key() {
        let locking = Locking::in_memory().with_poll_interval(Duration::from_millis(5));
        let lease = locking
            .acquire("k", Duration::from_secs(10), Duration::from_millis(50))
            .await
            .unwrap();
        drop(lease);

        let started = Instant::now();
        locking
            .acquire("k", Duration::from_secs(10), Duration::from_millis(500))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_cancelled_holder_frees_the_key() {
        let locking = Locking::in_memory().with_poll_interval(Duration::from_millis(5));
        let holder = {
            let locking = locking.clone();
            async move {
                let _lease = locking
                    .acquire("k", Duration::from_secs(10), Duration::from_millis(50))
                    .await
                    .unwrap();
                std::future::pending::<()>().await;
            }
        };
        assert!(
            tokio::time::timeout(Duration::from_millis(20), holder)
                .await
                .is_err()
        );

        locking
            .acquire("k", Duration::from_secs(10), Duration::from_millis(500))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_holder_frees_the_key() {
        let locking = Locking::in_memory().with_poll_interval(Duration::from_millis(5));
        let holder = {
            let locking = locking.clone();
            tokio::spawn(async move {
                let _lease = locking
                    .acquire("k", Duration::from_secs(10), Duration::from_millis(50))
                    .await
                    .unwrap();
                panic!("exchange blew up");
            })
        };
        assert!(holder.await.unwrap_err().is_panic());

        locking
            .acquire("k", Duration::from_secs(10), Duration::from_millis(500))
            .await
            .unwrap();
    }

    struct BrokenStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LockStore for BrokenStore {
        async fn try_acquire(&self, _: &str, _: &str, _: Duration) -> Result<bool, LockError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LockError::Unavailable("connection refused".into()))
        }

        async fn release(&self, _: &str, _: &str) -> Result<(), LockError> {
            Err(LockError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_errors_fail_fast() {
        let store = Arc::new(BrokenStore {
            calls: AtomicUsize::new(0),
        });
        let locking = Locking::new(store.clone());

        let error = locking
            .acquire("k", Duration::from_secs(1), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(error, LockError::Unavailable(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }
}
