//! Per-key mutual exclusion.
//!
//! The orchestrator never relies on an in-process mutex: writers for a key
//! may live in other processes sharing the same store. A [`LockBackend`] is
//! the shared primitive (a cache with set-if-absent, a lock directory, ...).
//! [`LockManager`] adds bounded retry with backoff on top and hands out
//! [`HeldLock`] guards that can keep themselves alive while a long flush
//! runs.
pub mod file;
pub mod manager;
pub mod memory;

use crate::error::MemoryResult;
use crate::key::StorageKey;
use async_trait::async_trait;
use std::time::Duration;

pub use file::FileLockBackend;
pub use manager::{HeldLock, LockManager};
pub use memory::InMemoryLockBackend;

/// Shared lock table keyed by storage key.
///
/// Every call carries the owner token of the caller. A lock whose TTL has
/// elapsed is free for anyone to take.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take the lock if it is free or expired. `Ok(false)` means contended.
    async fn try_acquire(&self, key: &StorageKey, owner: &str, ttl: Duration)
    -> MemoryResult<bool>;

    /// Push the expiry `ttl` into the future. `Ok(false)` if `owner` no
    /// longer holds the lock.
    async fn refresh(&self, key: &StorageKey, owner: &str, ttl: Duration) -> MemoryResult<bool>;

    /// Drop the lock. `Ok(false)` if it had already expired or changed hands.
    async fn release(&self, key: &StorageKey, owner: &str) -> MemoryResult<bool>;

    /// Whether `owner` currently holds an unexpired lock on `key`.
    async fn is_held(&self, key: &StorageKey, owner: &str) -> MemoryResult<bool>;
}
