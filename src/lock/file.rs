//! Lock files in a shared directory.
//!
//! A lock is a file `<sha256(key)>.lock` holding
//! `{"owner": ..., "expires_at": ...}`, published with a hard link so that
//! creation fails if the file already exists. Any process that can see the
//! directory can contend for it. An expired lock file is moved aside and
//! replaced; if the file moved aside turns out not to be the stale record
//! that was inspected, it is linked back.
use super::LockBackend;
use crate::error::{MemoryError, MemoryResult};
use crate::key::StorageKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockFileRecord {
    owner: String,
    expires_at: DateTime<Utc>,
}

impl LockFileRecord {
    fn new(owner: &str, ttl: Duration) -> MemoryResult<Self> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| MemoryError::config(format!("lock ttl out of range: {}", e)))?;
        Ok(Self {
            owner: owner.to_string(),
            expires_at: Utc::now() + ttl,
        })
    }

    fn is_live(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

/// Lock backend usable across processes sharing a directory.
#[derive(Debug, Clone)]
pub struct FileLockBackend {
    dir: PathBuf,
}

impl FileLockBackend {
    pub async fn open(dir: impl Into<PathBuf>) -> MemoryResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| MemoryError::store(dir.display().to_string(), "open_lock_dir", e))?;
        Ok(Self { dir })
    }

    fn lock_path(&self, key: &StorageKey) -> PathBuf {
        self.dir
            .join(format!("{}.lock", StorageKey::sanitize(key.as_str())))
    }

    async fn read_record(
        &self,
        key: &StorageKey,
        path: &Path,
    ) -> MemoryResult<Option<(Vec<u8>, Option<LockFileRecord>)>> {
        match fs::read(path).await {
            // Unparsable records count as stale.
            Ok(raw) => {
                let record = serde_json::from_slice(&raw).ok();
                Ok(Some((raw, record)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MemoryError::store(key.as_str(), "read_lock", e)),
        }
    }

    /// Publish `record` at `path` unless a file is already there.
    ///
    /// The record is written to a temporary file and hard-linked into place,
    /// so the lock file never exists half-written.
    async fn create_new(
        &self,
        key: &StorageKey,
        path: &Path,
        record: &LockFileRecord,
    ) -> MemoryResult<bool> {
        let bytes = serde_json::to_vec(record)?;
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| MemoryError::store(key.as_str(), "acquire_lock", e))?;
        let linked = fs::hard_link(&temp_path, path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(MemoryError::store(key.as_str(), "acquire_lock", e)),
        }
    }

    /// Move a stale lock file aside. Returns true if the path is now free.
    async fn evict_stale(
        &self,
        key: &StorageKey,
        path: &Path,
        stale: &[u8],
    ) -> MemoryResult<bool> {
        let aside = path.with_extension(format!("stale.{}", uuid::Uuid::new_v4().simple()));
        match fs::rename(path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(MemoryError::store(key.as_str(), "evict_stale_lock", e)),
        }

        let moved = match fs::read(&aside).await {
            Ok(moved) => moved,
            Err(e) => {
                if fs::hard_link(&aside, path).await.is_ok() {
                    let _ = fs::remove_file(&aside).await;
                }
                return Err(MemoryError::store(key.as_str(), "evict_stale_lock", e));
            }
        };
        if moved != stale {
            // Someone else already replaced the stale file; put theirs back.
            let restored = fs::hard_link(&aside, path).await.is_ok();
            let _ = fs::remove_file(&aside).await;
            debug!(memory_id = %key, restored, "Lock changed hands during takeover");
            return Ok(false);
        }
        let _ = fs::remove_file(&aside).await;
        Ok(true)
    }

    async fn write_record(
        &self,
        key: &StorageKey,
        path: &Path,
        record: &LockFileRecord,
    ) -> MemoryResult<()> {
        let bytes = serde_json::to_vec(record)?;
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| MemoryError::store(key.as_str(), "refresh_lock", e))?;
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(MemoryError::store(key.as_str(), "refresh_lock", e));
        }
        Ok(())
    }
}

#[async_trait]
impl LockBackend for FileLockBackend {
    async fn try_acquire(
        &self,
        key: &StorageKey,
        owner: &str,
        ttl: Duration,
    ) -> MemoryResult<bool> {
        let path = self.lock_path(key);
        let record = LockFileRecord::new(owner, ttl)?;
        if self.create_new(key, &path, &record).await? {
            return Ok(true);
        }

        let Some((raw, existing)) = self.read_record(key, &path).await? else {
            return self.create_new(key, &path, &record).await;
        };
        if existing.as_ref().is_some_and(|r| r.is_live()) {
            return Ok(false);
        }

        debug!(memory_id = %key, "Taking over expired lock file");
        if !self.evict_stale(key, &path, &raw).await? {
            return Ok(false);
        }
        self.create_new(key, &path, &record).await
    }

    async fn refresh(&self, key: &StorageKey, owner: &str, ttl: Duration) -> MemoryResult<bool> {
        let path = self.lock_path(key);
        match self.read_record(key, &path).await? {
            Some((_, Some(record))) if record.owner == owner && record.is_live() => {
                self.write_record(key, &path, &LockFileRecord::new(owner, ttl)?)
                    .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &StorageKey, owner: &str) -> MemoryResult<bool> {
        let path = self.lock_path(key);
        let Some((_, Some(record))) = self.read_record(key, &path).await? else {
            return Ok(false);
        };
        if record.owner != owner {
            return Ok(false);
        }
        match fs::remove_file(&path).await {
            Ok(()) => Ok(record.is_live()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MemoryError::store(key.as_str(), "release_lock", e)),
        }
    }

    async fn is_held(&self, key: &StorageKey, owner: &str) -> MemoryResult<bool> {
        let path = self.lock_path(key);
        Ok(matches!(
            self.read_record(key, &path).await?,
            Some((_, Some(record))) if record.owner == owner && record.is_live()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key() -> StorageKey {
        StorageKey::new("lock:file").unwrap()
    }

    #[tokio::test]
    async fn test_two_backends_share_directory() {
        let dir = TempDir::new().unwrap();
        let first = FileLockBackend::open(dir.path()).await.unwrap();
        let second = FileLockBackend::open(dir.path()).await.unwrap();
        let ttl = Duration::from_secs(30);

        assert!(first.try_acquire(&key(), "p1", ttl).await.unwrap());
        assert!(!second.try_acquire(&key(), "p2", ttl).await.unwrap());
        assert!(second.is_held(&key(), "p1").await.unwrap());

        assert!(first.release(&key(), "p1").await.unwrap());
        assert!(second.try_acquire(&key(), "p2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_file_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let backend = FileLockBackend::open(dir.path()).await.unwrap();
        assert!(
            backend
                .try_acquire(&key(), "old", Duration::from_millis(1))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(
            backend
                .try_acquire(&key(), "new", Duration::from_secs(30))
                .await
                .unwrap()
        );
        assert!(backend.is_held(&key(), "new").await.unwrap());
        assert!(!backend.release(&key(), "old").await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_only_by_owner() {
        let dir = TempDir::new().unwrap();
        let backend = FileLockBackend::open(dir.path()).await.unwrap();
        let ttl = Duration::from_secs(30);
        backend.try_acquire(&key(), "me", ttl).await.unwrap();

        assert!(backend.refresh(&key(), "me", ttl).await.unwrap());
        assert!(!backend.refresh(&key(), "you", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_stale_lock_is_store_error() {
        let dir = TempDir::new().unwrap();
        let backend = FileLockBackend::open(dir.path()).await.unwrap();
        let path = backend.lock_path(&key());
        // A directory renames fine but cannot be read back as a record.
        std::fs::create_dir(&path).unwrap();

        let err = backend
            .evict_stale(&key(), &path, b"{}")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Store {
                operation: "evict_stale_lock",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_garbage_lock_file_is_stale() {
        let dir = TempDir::new().unwrap();
        let backend = FileLockBackend::open(dir.path()).await.unwrap();
        std::fs::write(backend.lock_path(&key()), b"{").unwrap();
        assert!(
            backend
                .try_acquire(&key(), "me", Duration::from_secs(5))
                .await
                .unwrap()
        );
    }
}
