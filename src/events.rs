//! Change notifications and counters for memory instances.
//!
//! Every instance publishes [`MemoryEvent`]s on a broadcast channel. Metrics
//! exporters and dashboards subscribe; a slow or absent subscriber never
//! blocks an operation (lagging receivers drop the oldest events).
//!
//! # Example
//!
//! ```ignore
//! let mut rx = instance.subscribe();
//! while let Ok(event) = rx.recv().await {
//!     println!("{:?}", event);
//! }
//! ```
use crate::key::StorageKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Default channel capacity for event broadcasts.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened to a memory instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryEvent {
    /// Messages were persisted.
    Appended {
        key: StorageKey,
        count: usize,
        timestamp: DateTime<Utc>,
    },
    /// An append scheduled a background flush.
    FlushScheduled {
        key: StorageKey,
        timestamp: DateTime<Utc>,
    },
    /// A flush committed a new list.
    Flushed {
        key: StorageKey,
        strategy: String,
        summarized: usize,
        evicted: usize,
        tokens_before: usize,
        tokens_after: usize,
        timestamp: DateTime<Utc>,
    },
    /// The list was deleted.
    Cleared {
        key: StorageKey,
        timestamp: DateTime<Utc>,
    },
    /// The lock was busy on at least one attempt.
    LockContention {
        key: StorageKey,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
}

impl MemoryEvent {
    pub fn key(&self) -> &StorageKey {
        match self {
            MemoryEvent::Appended { key, .. }
            | MemoryEvent::FlushScheduled { key, .. }
            | MemoryEvent::Flushed { key, .. }
            | MemoryEvent::Cleared { key, .. }
            | MemoryEvent::LockContention { key, .. } => key,
        }
    }
}

/// Publisher side of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MemoryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.sender.subscribe()
    }

    /// Publish; having no subscribers is fine.
    pub fn publish(&self, event: MemoryEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Running counters of one instance.
#[derive(Debug, Default)]
pub struct InstanceStats {
    appends: AtomicU64,
    flushes: AtomicU64,
    summaries: AtomicU64,
    evicted_messages: AtomicU64,
    lock_timeouts: AtomicU64,
}

impl InstanceStats {
    pub(crate) fn record_append(&self, count: usize) {
        self.appends.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, summarized: bool, evicted: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        if summarized {
            self.summaries.fetch_add(1, Ordering::Relaxed);
        }
        self.evicted_messages
            .fetch_add(evicted as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            appends: self.appends.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            summaries: self.summaries.load(Ordering::Relaxed),
            evicted_messages: self.evicted_messages.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`InstanceStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub appends: u64,
    pub flushes: u64,
    pub summaries: u64,
    pub evicted_messages: u64,
    pub lock_timeouts: u64,
}
