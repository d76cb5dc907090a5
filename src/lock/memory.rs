//! In-process lock table.
use super::LockBackend;
use crate::error::MemoryResult;
use crate::key::StorageKey;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct LockRecord {
    owner: String,
    expires_at: Instant,
}

impl LockRecord {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Lock backend for a single process, or for tests.
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    locks: DashMap<StorageKey, LockRecord>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `key`, if the lock is live.
    pub fn holder(&self, key: &StorageKey) -> Option<String> {
        let now = Instant::now();
        self.locks
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.owner.clone())
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(
        &self,
        key: &StorageKey,
        owner: &str,
        ttl: Duration,
    ) -> MemoryResult<bool> {
        let now = Instant::now();
        let record = LockRecord {
            owner: owner.to_string(),
            expires_at: now + ttl,
        };
        match self.locks.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(true)
            }
            Entry::Occupied(mut slot) if !slot.get().is_live(now) => {
                slot.insert(record);
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
        }
    }

    async fn refresh(&self, key: &StorageKey, owner: &str, ttl: Duration) -> MemoryResult<bool> {
        let now = Instant::now();
        match self.locks.get_mut(key) {
            Some(mut record) if record.owner == owner && record.is_live(now) => {
                record.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &StorageKey, owner: &str) -> MemoryResult<bool> {
        let now = Instant::now();
        let mut was_live = false;
        let removed = self.locks.remove_if(key, |_, record| {
            was_live = record.is_live(now);
            record.owner == owner
        });
        Ok(removed.is_some() && was_live)
    }

    async fn is_held(&self, key: &StorageKey, owner: &str) -> MemoryResult<bool> {
        let now = Instant::now();
        Ok(self
            .locks
            .get(key)
            .is_some_and(|r| r.owner == owner && r.is_live(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StorageKey {
        StorageKey::new("lock:mem").unwrap()
    }

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let backend = InMemoryLockBackend::new();
        let ttl = Duration::from_secs(5);
        assert!(backend.try_acquire(&key(), "a", ttl).await.unwrap());
        assert!(!backend.try_acquire(&key(), "b", ttl).await.unwrap());
        assert_eq!(backend.holder(&key()).as_deref(), Some("a"));

        assert!(backend.release(&key(), "a").await.unwrap());
        assert!(backend.try_acquire(&key(), "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_by_stranger_is_refused() {
        let backend = InMemoryLockBackend::new();
        backend
            .try_acquire(&key(), "a", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!backend.release(&key(), "b").await.unwrap());
        assert!(backend.is_held(&key(), "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_can_be_taken_over() {
        let backend = InMemoryLockBackend::new();
        let ttl = Duration::from_secs(1);
        backend.try_acquire(&key(), "a", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(!backend.is_held(&key(), "a").await.unwrap());
        assert!(!backend.refresh(&key(), "a", ttl).await.unwrap());
        assert!(backend.try_acquire(&key(), "b", ttl).await.unwrap());
        assert!(!backend.release(&key(), "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_expiry() {
        let backend = InMemoryLockBackend::new();
        let ttl = Duration::from_secs(2);
        backend.try_acquire(&key(), "a", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(backend.refresh(&key(), "a", ttl).await.unwrap());
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(backend.is_held(&key(), "a").await.unwrap());
    }
}
