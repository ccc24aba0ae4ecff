use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use super::{LockError, LockStore};

/// Process-local lock table
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if let Some((holder, expires_at)) = entries.get(key) {
            if *expires_at > now && holder != owner {
                return Ok(false);
            }
        }

        entries.insert(key.to_string(), (owner.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|(holder, _)| holder == owner) {
            entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_by_other_owner_is_ignored() {
        let store = MemoryLockStore::new();
        assert!(store.try_acquire("k", "a", Duration::from_secs(5)).await.unwrap());
        store.release("k", "b").await.unwrap();
        assert!(!store.try_acquire("k", "b", Duration::from_secs(5)).await.unwrap());
        store.release("k", "a").await.unwrap();
        assert!(store.try_acquire("k", "b", Duration::from_secs(5)).await.unwrap());
    }
}
