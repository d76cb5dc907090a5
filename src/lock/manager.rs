//! Lock acquisition with retry, and held-lock guards.
use super::LockBackend;
use crate::config::LockConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::key::StorageKey;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hands out per-key locks from a shared backend.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn LockBackend> {
        &self.backend
    }

    /// Acquire the lock for `key`, retrying with exponential backoff.
    ///
    /// Gives up with [`MemoryError::LockTimeout`] after
    /// `config.max_retries` attempts, or with [`MemoryError::Cancelled`] as
    /// soon as `cancel` fires. Acquisition order between contenders is
    /// whatever order their attempts land in; there is no fairness.
    pub async fn acquire(
        &self,
        key: &StorageKey,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> MemoryResult<HeldLock> {
        let owner = Uuid::new_v4().to_string();
        let attempts = self.config.max_retries.max(1);

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled {
                    operation: "acquire_lock",
                });
            }

            if self.backend.try_acquire(key, &owner, ttl).await? {
                debug!(memory_id = %key, attempt, "Lock acquired");
                return Ok(HeldLock {
                    key: key.clone(),
                    owner,
                    ttl,
                    refresh_interval: self.config.refresh_interval(ttl),
                    backend: Arc::clone(&self.backend),
                    lost: Arc::new(AtomicBool::new(false)),
                    refresh: None,
                    released: false,
                    contended_attempts: attempt,
                });
            }

            if attempt + 1 == attempts {
                break;
            }
            let delay = self.backoff(attempt);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(MemoryError::Cancelled { operation: "acquire_lock" });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        warn!(memory_id = %key, attempts, "Lock acquisition timed out");
        Err(MemoryError::LockTimeout {
            key: key.to_string(),
            attempts,
        })
    }

    /// `min(base * 2^attempt, max)` plus up to half of that again as jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_ms.max(1);
        let capped = base
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.config.retry_max_ms.max(base));
        let jitter = rand::thread_rng().gen_range(0..=capped / 2);
        Duration::from_millis(capped + jitter)
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A lock currently held by this process.
///
/// Release explicitly with [`HeldLock::release`]. A guard dropped without
/// release schedules a best-effort release on the current runtime; the TTL
/// is the last resort.
pub struct HeldLock {
    key: StorageKey,
    owner: String,
    ttl: Duration,
    refresh_interval: Duration,
    backend: Arc<dyn LockBackend>,
    lost: Arc<AtomicBool>,
    refresh: Option<CancellationToken>,
    released: bool,
    contended_attempts: u32,
}

impl HeldLock {
    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Failed attempts before this lock was obtained.
    pub fn contended_attempts(&self) -> u32 {
        self.contended_attempts
    }

    /// Keep the lock alive until release by re-extending it every
    /// `ttl / refresh_divisor`.
    ///
    /// A refresh that finds the lock gone marks it lost. A refresh that
    /// errors is logged and refreshing stops; [`HeldLock::validate`] then
    /// asks the backend directly.
    pub fn start_refresh(&mut self) {
        if self.refresh.is_some() {
            return;
        }
        let stop = CancellationToken::new();
        self.refresh = Some(stop.clone());

        let backend = Arc::clone(&self.backend);
        let lost = Arc::clone(&self.lost);
        let key = self.key.clone();
        let owner = self.owner.clone();
        let ttl = self.ttl;
        let interval = self.refresh_interval;

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match backend.refresh(&key, &owner, ttl).await {
                    Ok(true) => debug!(memory_id = %key, "Lock refreshed"),
                    Ok(false) => {
                        lost.store(true, Ordering::SeqCst);
                        warn!(memory_id = %key, "Lock lost before refresh");
                        break;
                    }
                    Err(e) => {
                        warn!(memory_id = %key, error = %e, "Lock refresh failed, stopping refresh");
                        break;
                    }
                }
            }
        });
    }

    /// Whether a refresh observed the lock gone.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Confirm the lock is still ours before committing a write.
    pub async fn validate(&self) -> MemoryResult<()> {
        if self.is_lost() || !self.backend.is_held(&self.key, &self.owner).await? {
            self.lost.store(true, Ordering::SeqCst);
            return Err(MemoryError::LockLost {
                key: self.key.to_string(),
            });
        }
        Ok(())
    }

    /// Release the lock.
    ///
    /// Fails with [`MemoryError::LockLost`] if it had already expired or
    /// changed hands.
    pub async fn release(mut self) -> MemoryResult<()> {
        self.stop_refresh();
        self.released = true;
        if self.backend.release(&self.key, &self.owner).await? {
            debug!(memory_id = %self.key, "Lock released");
            Ok(())
        } else {
            Err(MemoryError::LockLost {
                key: self.key.to_string(),
            })
        }
    }

    fn stop_refresh(&mut self) {
        if let Some(stop) = self.refresh.take() {
            stop.cancel();
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.stop_refresh();
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(memory_id = %self.key, "Lock dropped outside a runtime, left to expire");
            return;
        };
        let backend = Arc::clone(&self.backend);
        let key = self.key.clone();
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            if let Err(e) = backend.release(&key, &owner).await {
                warn!(memory_id = %key, error = %e, "Best-effort lock release failed");
            }
        });
    }
}

impl std::fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldLock")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("ttl", &self.ttl)
            .field("lost", &self.is_lost())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockBackend;

    fn manager(max_retries: u32) -> (Arc<InMemoryLockBackend>, LockManager) {
        let backend = Arc::new(InMemoryLockBackend::new());
        let config = LockConfig {
            max_retries,
            retry_base_ms: 1,
            retry_max_ms: 5,
            ..Default::default()
        };
        (backend.clone(), LockManager::new(backend, config))
    }

    fn key() -> StorageKey {
        StorageKey::new("lock:manager").unwrap()
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (backend, manager) = manager(3);
        let cancel = CancellationToken::new();
        let lock = manager
            .acquire(&key(), Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(backend.holder(&key()).as_deref(), Some(lock.owner()));
        lock.release().await.unwrap();
        assert!(backend.holder(&key()).is_none());
    }

    #[tokio::test]
    async fn test_timeout_after_bounded_retries() {
        let (_, manager) = manager(3);
        let cancel = CancellationToken::new();
        let _held = manager
            .acquire(&key(), Duration::from_secs(5), &cancel)
            .await
            .unwrap();

        let err = manager
            .acquire(&key(), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::LockTimeout { attempts: 3, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let (_, manager) = manager(1_000);
        let cancel = CancellationToken::new();
        let _held = manager
            .acquire(&key(), Duration::from_secs(5), &cancel)
            .await
            .unwrap();

        let waiter = CancellationToken::new();
        waiter.cancel();
        let err = manager
            .acquire(&key(), Duration::from_secs(5), &waiter)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_release_after_expiry_is_lock_lost() {
        let (_, manager) = manager(1);
        let cancel = CancellationToken::new();
        let lock = manager
            .acquire(&key(), Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lock.validate().await.is_err());
        assert!(matches!(
            lock.release().await,
            Err(MemoryError::LockLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_refresh_outlives_ttl() {
        let (backend, manager) = manager(1);
        let cancel = CancellationToken::new();
        let mut lock = manager
            .acquire(&key(), Duration::from_millis(100), &cancel)
            .await
            .unwrap();
        lock.start_refresh();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!lock.is_lost());
        assert!(lock.validate().await.is_ok());
        assert_eq!(backend.holder(&key()).as_deref(), Some(lock.owner()));
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let (backend, manager) = manager(1);
        let cancel = CancellationToken::new();
        let lock = manager
            .acquire(&key(), Duration::from_secs(30), &cancel)
            .await
            .unwrap();
        drop(lock);

        for _ in 0..50 {
            if backend.holder(&key()).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(backend.holder(&key()).is_none());
    }

    #[test]
    fn test_backoff_is_capped() {
        let (_, manager) = manager(5);
        for attempt in 0..40 {
            let delay = manager.backoff(attempt);
            assert!(delay <= Duration::from_millis(5 + 5 / 2));
        }
    }
}
