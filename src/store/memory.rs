//! In-process message store.
//!
//! Backed by a [`DashMap`]. With simulated latency, `append_message`
//! becomes a visible read-modify-write: it reads the list, sleeps, then
//! writes the extended list back. Two unsynchronized appenders then lose
//! writes, the same way they would against a remote store.
use super::MemoryStore;
use crate::error::{MemoryError, MemoryResult};
use crate::key::StorageKey;
use crate::types::Message;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
struct Entry {
    messages: Vec<Message>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Message store living in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<StorageKey, Entry>,
    latency: Option<Duration>,
    failures: DashMap<&'static str, usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Default::default()
        }
    }

    /// Make the next `times` calls of `operation` fail.
    pub fn fail_next(&self, operation: &'static str, times: usize) {
        self.failures.insert(operation, times);
    }

    /// Remaining TTL of a key, if one is set and not yet elapsed.
    pub fn ttl(&self, key: &StorageKey) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        let at = entry.expires_at?;
        at.checked_duration_since(Instant::now())
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_failure(&self, key: &StorageKey, operation: &'static str) -> MemoryResult<()> {
        let mut fail = false;
        self.failures.remove_if_mut(&operation, |_, remaining| {
            fail = true;
            *remaining -= 1;
            *remaining == 0
        });
        if fail {
            return Err(MemoryError::store(
                key.as_str(),
                operation,
                "injected store failure",
            ));
        }
        Ok(())
    }

    fn snapshot(&self, key: &StorageKey) -> Vec<Message> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        self.entries
            .get(key)
            .map(|e| e.messages.clone())
            .unwrap_or_default()
    }

    fn write(&self, key: &StorageKey, messages: Vec<Message>) {
        let mut entry = self.entries.entry(key.clone()).or_default();
        entry.messages = messages;
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn append_message(&self, key: &StorageKey, message: &Message) -> MemoryResult<()> {
        self.append_messages(key, std::slice::from_ref(message)).await
    }

    async fn append_messages(&self, key: &StorageKey, messages: &[Message]) -> MemoryResult<()> {
        self.check_failure(key, "append_message")?;
        let mut current = self.snapshot(key);
        self.delay().await;
        current.extend_from_slice(messages);
        self.write(key, current);
        Ok(())
    }

    async fn read_messages(&self, key: &StorageKey) -> MemoryResult<Vec<Message>> {
        self.check_failure(key, "read_messages")?;
        self.delay().await;
        Ok(self.snapshot(key))
    }

    async fn count_messages(&self, key: &StorageKey) -> MemoryResult<usize> {
        self.check_failure(key, "count_messages")?;
        self.delay().await;
        Ok(self.snapshot(key).len())
    }

    async fn replace_messages(&self, key: &StorageKey, messages: &[Message]) -> MemoryResult<()> {
        self.check_failure(key, "replace_messages")?;
        self.delay().await;
        self.write(key, messages.to_vec());
        Ok(())
    }

    async fn set_expiration(&self, key: &StorageKey, ttl: Duration) -> MemoryResult<()> {
        self.check_failure(key, "set_expiration")?;
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn delete_all(&self, key: &StorageKey) -> MemoryResult<()> {
        self.check_failure(key, "delete_all")?;
        self.delay().await;
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> MemoryResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StorageKey {
        StorageKey::new("test:store").unwrap()
    }

    #[tokio::test]
    async fn test_append_read_count() {
        let store = InMemoryStore::new();
        store.append_message(&key(), &Message::user("a")).await.unwrap();
        store
            .append_messages(&key(), &[Message::assistant("b"), Message::user("c")])
            .await
            .unwrap();

        let messages = store.read_messages(&key()).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "b");
        assert_eq!(store.count_messages(&key()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_missing_key_reads_empty() {
        let store = InMemoryStore::new();
        assert!(store.read_messages(&key()).await.unwrap().is_empty());
        assert_eq!(store.count_messages(&key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replace_and_delete() {
        let store = InMemoryStore::new();
        store.append_message(&key(), &Message::user("old")).await.unwrap();
        store
            .replace_messages(&key(), &[Message::system("new")])
            .await
            .unwrap();
        assert_eq!(store.read_messages(&key()).await.unwrap()[0].content, "new");

        store.delete_all(&key()).await.unwrap();
        assert_eq!(store.count_messages(&key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_paginated_default() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store
                .append_message(&key(), &Message::user(format!("{}", i)))
                .await
                .unwrap();
        }
        let (page, total) = store.read_messages_paginated(&key(), 1, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(
            page.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["1", "2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiration() {
        let store = InMemoryStore::new();
        store.append_message(&key(), &Message::user("a")).await.unwrap();
        store
            .set_expiration(&key(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.ttl(&key()).is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.read_messages(&key()).await.unwrap().is_empty());
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_carries_context() {
        let store = InMemoryStore::new();
        store.fail_next("read_messages", 1);
        let err = store.read_messages(&key()).await.unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Store {
                operation: "read_messages",
                ..
            }
        ));
        assert!(store.read_messages(&key()).await.is_ok());
    }
}
