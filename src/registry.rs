//! Scoped cache of memory instances.
//!
//! A registry lives as long as the unit of work that owns it (a workflow
//! execution, a request, a test) and maps storage keys to instance handles
//! so every caller in that scope shares one instance per key. Invalidate
//! entries when the scope ends; nothing is global.
use crate::error::MemoryResult;
use crate::instance::MemoryInstance;
use crate::key::StorageKey;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    instances: DashMap<StorageKey, MemoryInstance>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached instance for `key`, or one built by `create` and cached.
    ///
    /// `create` runs at most once per key while the entry is cached. If it
    /// fails nothing is cached.
    pub fn get_or_create<F>(&self, key: &StorageKey, create: F) -> MemoryResult<MemoryInstance>
    where
        F: FnOnce() -> MemoryResult<MemoryInstance>,
    {
        match self.instances.entry(key.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(slot) => {
                let instance = create()?;
                debug!(memory_id = %key, "Registered memory instance");
                Ok(slot.insert(instance).clone())
            }
        }
    }

    pub fn get(&self, key: &StorageKey) -> Option<MemoryInstance> {
        self.instances.get(key).map(|e| e.value().clone())
    }

    /// Forget one instance; returns it so callers can drain its flushes.
    pub fn invalidate(&self, key: &StorageKey) -> Option<MemoryInstance> {
        self.instances.remove(key).map(|(_, instance)| instance)
    }

    /// Forget every instance, returning them.
    pub fn invalidate_all(&self) -> Vec<MemoryInstance> {
        let keys: Vec<StorageKey> = self.instances.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter_map(|k| self.invalidate(k)).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
