//! Directory-backed message store.
//!
//! Each storage key owns two files in the store directory, named after the
//! SHA-256 of the key:
//!
//! - `<hash>.json`: the message list as a JSON array
//! - `<hash>.ttl`: optional expiry record `{"expires_at": ...}`
//!
//! Every write goes to a uniquely named temporary file first and is then
//! renamed over the target, so readers in any process see either the old
//! list or the new one. Several processes may share the directory as long
//! as they serialize writers per key through the lock manager.
use super::MemoryStore;
use crate::error::{MemoryError, MemoryResult};
use crate::key::StorageKey;
use crate::types::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct ExpiryRecord {
    expires_at: DateTime<Utc>,
}

/// Message store persisting one JSON file per key.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::Store` if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> MemoryResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| MemoryError::store(dir.display().to_string(), "open", e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, key: &StorageKey) -> PathBuf {
        self.dir
            .join(format!("{}.json", StorageKey::sanitize(key.as_str())))
    }

    fn ttl_path(&self, key: &StorageKey) -> PathBuf {
        self.dir
            .join(format!("{}.ttl", StorageKey::sanitize(key.as_str())))
    }

    /// Write `bytes` to `path` through a temporary file and rename.
    async fn write_atomic(
        &self,
        key: &StorageKey,
        operation: &'static str,
        path: &Path,
        bytes: &[u8],
    ) -> MemoryResult<()> {
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&temp_path, bytes)
            .await
            .map_err(|e| MemoryError::store(key.as_str(), operation, e))?;
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(MemoryError::store(key.as_str(), operation, e));
        }
        Ok(())
    }

    async fn remove_if_present(
        &self,
        key: &StorageKey,
        operation: &'static str,
        path: &Path,
    ) -> MemoryResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MemoryError::store(key.as_str(), operation, e)),
        }
    }

    /// Drop the key's files if its TTL has elapsed.
    async fn purge_if_expired(
        &self,
        key: &StorageKey,
        operation: &'static str,
    ) -> MemoryResult<()> {
        let raw = match fs::read(self.ttl_path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MemoryError::store(key.as_str(), operation, e)),
        };
        let record: ExpiryRecord = serde_json::from_slice(&raw)
            .map_err(|e| MemoryError::store(key.as_str(), operation, e))?;
        if record.expires_at <= Utc::now() {
            debug!(memory_id = %key, "Key expired, removing files");
            self.remove_if_present(key, operation, &self.data_path(key))
                .await?;
            self.remove_if_present(key, operation, &self.ttl_path(key))
                .await?;
        }
        Ok(())
    }

    async fn load(&self, key: &StorageKey, operation: &'static str) -> MemoryResult<Vec<Message>> {
        self.purge_if_expired(key, operation).await?;
        let raw = match fs::read(self.data_path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MemoryError::store(key.as_str(), operation, e)),
        };
        serde_json::from_slice(&raw).map_err(|e| MemoryError::store(key.as_str(), operation, e))
    }

    async fn save(
        &self,
        key: &StorageKey,
        operation: &'static str,
        messages: &[Message],
    ) -> MemoryResult<()> {
        let bytes = serde_json::to_vec(messages)
            .map_err(|e| MemoryError::store(key.as_str(), operation, e))?;
        self.write_atomic(key, operation, &self.data_path(key), &bytes)
            .await
    }
}

#[async_trait]
impl MemoryStore for JsonFileStore {
    async fn append_message(&self, key: &StorageKey, message: &Message) -> MemoryResult<()> {
        let mut messages = self.load(key, "append_message").await?;
        messages.push(message.clone());
        self.save(key, "append_message", &messages).await
    }

    async fn append_messages(&self, key: &StorageKey, batch: &[Message]) -> MemoryResult<()> {
        let mut messages = self.load(key, "append_messages").await?;
        messages.extend_from_slice(batch);
        self.save(key, "append_messages", &messages).await
    }

    async fn read_messages(&self, key: &StorageKey) -> MemoryResult<Vec<Message>> {
        self.load(key, "read_messages").await
    }

    async fn count_messages(&self, key: &StorageKey) -> MemoryResult<usize> {
        Ok(self.load(key, "count_messages").await?.len())
    }

    async fn replace_messages(&self, key: &StorageKey, messages: &[Message]) -> MemoryResult<()> {
        self.save(key, "replace_messages", messages).await
    }

    async fn set_expiration(&self, key: &StorageKey, ttl: Duration) -> MemoryResult<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| MemoryError::store(key.as_str(), "set_expiration", e))?;
        let record = ExpiryRecord {
            expires_at: Utc::now() + ttl,
        };
        let bytes = serde_json::to_vec(&record)?;
        self.write_atomic(key, "set_expiration", &self.ttl_path(key), &bytes)
            .await
    }

    async fn delete_all(&self, key: &StorageKey) -> MemoryResult<()> {
        self.remove_if_present(key, "delete_all", &self.data_path(key))
            .await?;
        self.remove_if_present(key, "delete_all", &self.ttl_path(key))
            .await
    }

    async fn ping(&self) -> MemoryResult<()> {
        let meta = fs::metadata(&self.dir)
            .await
            .map_err(|e| MemoryError::store(self.dir.display().to_string(), "ping", e))?;
        if !meta.is_dir() {
            return Err(MemoryError::store(
                self.dir.display().to_string(),
                "ping",
                "store path is not a directory",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key() -> StorageKey {
        StorageKey::new("agent:file-test").unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        store.append_message(&key(), &Message::user("one")).await.unwrap();
        store
            .append_messages(&key(), &[Message::assistant("two").with_priority(2)])
            .await
            .unwrap();

        let reopened = JsonFileStore::open(dir.path()).await.unwrap();
        let messages = reopened.read_messages(&key()).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].priority(), Some(2));
    }

    #[tokio::test]
    async fn test_file_is_plain_json_array() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        store
            .replace_messages(&key(), &[Message::system("sys")])
            .await
            .unwrap();

        let raw = std::fs::read(store.data_path(&key())).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(
            value,
            serde_json::json!([{"role": "system", "content": "sys"}])
        );
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        for i in 0..3 {
            store
                .append_message(&key(), &Message::user(format!("{}", i)))
                .await
                .unwrap();
        }
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_expired_key_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        store.append_message(&key(), &Message::user("a")).await.unwrap();
        store
            .set_expiration(&key(), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.count_messages(&key()).await.unwrap(), 0);
        assert!(!store.data_path(&key()).exists());
    }

    #[tokio::test]
    async fn test_delete_all_and_ping() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        store.delete_all(&key()).await.unwrap();
        store.append_message(&key(), &Message::user("a")).await.unwrap();
        store.delete_all(&key()).await.unwrap();
        assert!(store.read_messages(&key()).await.unwrap().is_empty());
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_store_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        std::fs::write(store.data_path(&key()), b"not json").unwrap();
        assert!(matches!(
            store.read_messages(&key()).await,
            Err(MemoryError::Store {
                operation: "read_messages",
                ..
            })
        ));
    }
}
