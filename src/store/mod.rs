//! Message persistence.
//!
//! [`MemoryStore`] is the seam to whatever holds the message lists: a shared
//! cache, a database, a directory. One storage key maps to one ordered list.
//! Stores do no locking of their own; callers serialize writers per key
//! through the lock manager. `replace_messages` must be atomic: readers see
//! either the old list or the new one, never a mix.
pub mod file;
pub mod memory;

use crate::error::MemoryResult;
use crate::key::StorageKey;
use crate::types::Message;
use async_trait::async_trait;
use std::time::Duration;

pub use file::JsonFileStore;
pub use memory::InMemoryStore;

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Append one message to the end of the list, creating it if absent.
    async fn append_message(&self, key: &StorageKey, message: &Message) -> MemoryResult<()>;

    /// Append several messages as one write.
    async fn append_messages(&self, key: &StorageKey, messages: &[Message]) -> MemoryResult<()>;

    /// The whole list, oldest first. Missing keys read as empty.
    async fn read_messages(&self, key: &StorageKey) -> MemoryResult<Vec<Message>>;

    /// One page of the list plus the total message count.
    async fn read_messages_paginated(
        &self,
        key: &StorageKey,
        offset: usize,
        limit: usize,
    ) -> MemoryResult<(Vec<Message>, usize)> {
        let messages = self.read_messages(key).await?;
        let total = messages.len();
        let page = messages.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    async fn count_messages(&self, key: &StorageKey) -> MemoryResult<usize>;

    /// Atomically swap the whole list.
    async fn replace_messages(&self, key: &StorageKey, messages: &[Message]) -> MemoryResult<()>;

    /// Expire the key `ttl` from now.
    async fn set_expiration(&self, key: &StorageKey, ttl: Duration) -> MemoryResult<()>;

    /// Remove the list entirely.
    async fn delete_all(&self, key: &StorageKey) -> MemoryResult<()>;

    /// Liveness probe.
    async fn ping(&self) -> MemoryResult<()> {
        Ok(())
    }
}
