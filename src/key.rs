//! Storage keys.
//!
//! A storage key is the unit of sharing: one key names one logical memory
//! instance, one persisted message list and one lock. Keys are validated up
//! front so stores and lock backends can use them as file names or remote
//! identifiers without further escaping.
use crate::error::{MemoryError, MemoryResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Longest accepted storage key.
pub const MAX_KEY_LEN: usize = 256;

static KEY_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:/\-]+$").ok());

/// A validated storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(String);

impl StorageKey {
    /// Validate and wrap a key.
    pub fn new(raw: impl Into<String>) -> MemoryResult<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(invalid(&raw, "key is empty"));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(invalid(
                &raw,
                &format!("key exceeds {} characters", MAX_KEY_LEN),
            ));
        }
        let pattern = KEY_PATTERN
            .as_ref()
            .ok_or_else(|| invalid(&raw, "key pattern failed to compile"))?;
        if !pattern.is_match(&raw) {
            return Err(invalid(
                &raw,
                "only ASCII letters, digits and _ . : / - are allowed",
            ));
        }
        Ok(Self(raw))
    }

    /// Derive a key from arbitrary input (workflow ids, user names, URLs).
    ///
    /// The result is the lowercase SHA-256 hex digest of `raw`, so it is
    /// always valid and stable across processes.
    pub fn sanitize(raw: &str) -> Self {
        let digest = Sha256::digest(raw.as_bytes());
        Self(hex::encode(digest))
    }

    /// Build `<prefix>:<sanitized id>`; the prefix must itself be valid.
    pub fn scoped(prefix: &str, raw_id: &str) -> MemoryResult<Self> {
        let hashed = Self::sanitize(raw_id);
        Self::new(format!("{}:{}", prefix, hashed.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn invalid(key: &str, reason: &str) -> MemoryError {
    MemoryError::InvalidKey {
        key: key.chars().take(64).collect(),
        reason: reason.to_string(),
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StorageKey {
    type Error = MemoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StorageKey::new(value)
    }
}

impl TryFrom<&str> for StorageKey {
    type Error = MemoryError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        StorageKey::new(value)
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.0
    }
}
