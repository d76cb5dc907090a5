//! The memory instance: one storage key, one budget, one safe API.
//!
//! A [`MemoryInstance`] wires a store, a lock manager, a token counter, an
//! eviction policy and the flush strategy together. Writers for the same key
//! are serialized through the lock manager, never through an in-process
//! mutex, because other processes may share the store.
//!
//! # Operation flow
//!
//! ```text
//! append:  lock -> store.append -> count gate -> [schedule flush] -> unlock
//! flush:   lock + refresh -> read -> count -> summarize/evict -> validate lock
//!          -> store.replace -> unlock
//! clear:   lock -> store.delete_all -> unlock
//! read, len, token_count, health: lock-free
//! ```
//!
//! Appends on one key take effect in lock acquisition order, which is not
//! necessarily call order. Lock-free reads may miss a concurrent write.
//!
//! Scheduled flushes run on the runtime without the caller awaiting them;
//! [`MemoryInstance::wait_for_flushes`] joins them.
use crate::config::{FlushingStrategyKind, InstanceConfig, MemoryResource};
use crate::error::{MemoryError, MemoryResult};
use crate::events::{EventBus, InstanceStats, MemoryEvent, StatsSnapshot};
use crate::eviction::{EvictionPolicy, PriorityResolver, policy_for};
use crate::flush::{FlushContext, HybridFlushStrategy, RuleBasedSummarizer};
use crate::key::StorageKey;
use crate::lock::{HeldLock, InMemoryLockBackend, LockBackend, LockManager};
use crate::store::{InMemoryStore, MemoryStore};
use crate::tokens::{TiktokenCounter, TokenBudgetAllocator, TokenCountService, TokenCounter};
use crate::types::{FlushResult, MemoryHealth, Message};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Builder for [`MemoryInstance`].
///
/// Collaborators default to in-process implementations and the tiktoken
/// counter.
pub struct MemoryInstanceBuilder {
    key: StorageKey,
    resource: MemoryResource,
    config: InstanceConfig,
    store: Option<Arc<dyn MemoryStore>>,
    lock_backend: Option<Arc<dyn LockBackend>>,
    counter: Option<Arc<dyn TokenCounter>>,
    events: Option<EventBus>,
}

impl MemoryInstanceBuilder {
    pub fn new(key: StorageKey, resource: MemoryResource) -> Self {
        Self {
            key,
            resource,
            config: InstanceConfig::default(),
            store: None,
            lock_backend: None,
            counter: None,
            events: None,
        }
    }

    pub fn config(mut self, config: InstanceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn lock_backend(mut self, backend: Arc<dyn LockBackend>) -> Self {
        self.lock_backend = Some(backend);
        self
    }

    pub fn token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Publish on a shared bus instead of a private one.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the resource and assemble the instance.
    ///
    /// # Errors
    ///
    /// `Configuration` for an invalid resource or an empty budget,
    /// `EncodingUnavailable` if not even the counter's default encoding loads.
    pub fn build(self) -> MemoryResult<MemoryInstance> {
        self.resource.validate()?;

        let context_window = self
            .resource
            .model_context_size
            .unwrap_or(self.config.default_context_window);
        let token_limit =
            TokenBudgetAllocator::new().effective_limit(&self.resource, context_window)?;

        let counter = self
            .counter
            .unwrap_or_else(|| Arc::new(TiktokenCounter::new()));
        let tokens = TokenCountService::new(counter, self.resource.model.as_deref())?;

        let strategy = HybridFlushStrategy::new(self.resource.flushing_strategy.clone())
            .with_check_min_messages(self.config.flush_check_min_messages)
            .with_summarizer(RuleBasedSummarizer::new(self.config.summary_keep_last));

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let lock_backend = self
            .lock_backend
            .unwrap_or_else(|| Arc::new(InMemoryLockBackend::new()));
        let locks = LockManager::new(lock_backend, self.config.lock.clone());

        debug!(
            memory_id = %self.key,
            resource = %self.resource.id,
            token_limit,
            encoding = tokens.encoding(),
            "Memory instance created"
        );

        Ok(MemoryInstance {
            inner: Arc::new(Inner {
                policy: policy_for(&self.resource),
                resolver: PriorityResolver::from_resource(&self.resource),
                key: self.key,
                resource: self.resource,
                config: self.config,
                store,
                locks,
                tokens,
                strategy,
                token_limit,
                flush_pending: AtomicBool::new(false),
                flush_tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                last_flush: RwLock::new(None),
                events: self.events.unwrap_or_default(),
                stats: InstanceStats::default(),
            }),
        })
    }
}

struct Inner {
    key: StorageKey,
    resource: MemoryResource,
    config: InstanceConfig,
    store: Arc<dyn MemoryStore>,
    locks: LockManager,
    tokens: TokenCountService,
    policy: Arc<dyn EvictionPolicy>,
    resolver: PriorityResolver,
    strategy: HybridFlushStrategy,
    token_limit: usize,
    flush_pending: AtomicBool,
    flush_tasks: TaskTracker,
    shutdown: CancellationToken,
    last_flush: RwLock<Option<DateTime<Utc>>>,
    events: EventBus,
    stats: InstanceStats,
}

/// Handle to one memory instance. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryInstance {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryInstance")
            .field("key", &self.inner.key)
            .field("resource", &self.inner.resource.id)
            .field("token_limit", &self.inner.token_limit)
            .finish()
    }
}

impl MemoryInstance {
    pub fn builder(key: StorageKey, resource: MemoryResource) -> MemoryInstanceBuilder {
        MemoryInstanceBuilder::new(key, resource)
    }

    /// The storage key this instance owns.
    pub fn id(&self) -> &StorageKey {
        &self.inner.key
    }

    pub fn resource(&self) -> &MemoryResource {
        &self.inner.resource
    }

    /// Effective token ceiling.
    pub fn token_limit(&self) -> usize {
        self.inner.token_limit
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.inner.events.subscribe()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Append one message.
    ///
    /// Non-persistable messages are accepted and dropped. May schedule a
    /// background flush; the caller never waits for it.
    pub async fn append(&self, message: Message, cancel: &CancellationToken) -> MemoryResult<()> {
        self.append_many(vec![message], cancel).await
    }

    /// Append several messages in one locked write.
    pub async fn append_many(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> MemoryResult<()> {
        let total = messages.len();
        let messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| !m.is_non_persistable())
            .collect();
        if messages.len() < total {
            debug!(
                memory_id = %self.inner.key,
                skipped = total - messages.len(),
                "Skipping non-persistable messages"
            );
        }
        if messages.is_empty() {
            return Ok(());
        }

        let inner = &self.inner;
        let lock = self.lock(inner.config.lock.append_ttl(), cancel).await?;

        let result = guarded(cancel, "append", async {
            inner
                .store
                .append_messages(&inner.key, &messages)
                .await?;
            inner.store.count_messages(&inner.key).await
        })
        .await;

        match &result {
            Ok(count) => {
                if let Some(ttl) = inner.config.ttl.after_append() {
                    self.extend_ttl(ttl, "append").await;
                }
                inner.stats.record_append(messages.len());
                inner.events.publish(MemoryEvent::Appended {
                    key: inner.key.clone(),
                    count: messages.len(),
                    timestamp: Utc::now(),
                });
                debug!(memory_id = %inner.key, messages = count, "Appended");
                self.maybe_schedule_flush(*count);
            }
            Err(e) => {
                error!(memory_id = %inner.key, error = %e, "Append failed");
            }
        }

        self.release(lock, "append").await;
        result.map(|_| ())
    }

    /// Delete every message. The key is recreated by the next append.
    pub async fn clear(&self, cancel: &CancellationToken) -> MemoryResult<()> {
        let inner = &self.inner;
        let lock = self.lock(inner.config.lock.clear_ttl(), cancel).await?;

        let result = guarded(cancel, "clear", inner.store.delete_all(&inner.key)).await;
        match &result {
            Ok(()) => {
                if let Some(ttl) = inner.config.ttl.after_clear() {
                    self.extend_ttl(ttl, "clear").await;
                }
                inner.events.publish(MemoryEvent::Cleared {
                    key: inner.key.clone(),
                    timestamp: Utc::now(),
                });
                info!(memory_id = %inner.key, "Memory cleared");
            }
            Err(e) => error!(memory_id = %inner.key, error = %e, "Clear failed"),
        }

        self.release(lock, "clear").await;
        result
    }

    // ========================================================================
    // Flushing
    // ========================================================================

    /// Flush now with the configured strategy, regardless of the threshold.
    pub async fn flush(&self, cancel: &CancellationToken) -> MemoryResult<FlushResult> {
        self.flush_with_strategy(self.inner.resource.flushing_strategy.kind, cancel)
            .await
    }

    /// Flush now with an explicit strategy.
    pub async fn flush_with_strategy(
        &self,
        kind: FlushingStrategyKind,
        cancel: &CancellationToken,
    ) -> MemoryResult<FlushResult> {
        let inner = &self.inner;
        let lock = self.flush_lock(cancel).await?;
        let result = guarded(cancel, "flush", async {
            let messages = inner.store.read_messages(&inner.key).await?;
            self.commit_flush(&lock, kind, messages).await
        })
        .await;
        self.finish_flush(lock, &result).await;
        result
    }

    /// Wait for every scheduled background flush started so far.
    pub async fn wait_for_flushes(&self) {
        let tracker = &self.inner.flush_tasks;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }

    /// Cancel in-flight background flushes and wait for them to stop.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.wait_for_flushes().await;
    }

    fn maybe_schedule_flush(&self, message_count: usize) {
        let inner = &self.inner;
        if inner.resource.disable_flush || inner.shutdown.is_cancelled() {
            return;
        }
        let over_count = inner
            .resource
            .max_messages
            .is_some_and(|max| message_count > max);
        if !over_count && !inner.strategy.should_check_flush(message_count) {
            return;
        }
        if inner
            .flush_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(memory_id = %inner.key, "Flush already pending");
            return;
        }

        inner.events.publish(MemoryEvent::FlushScheduled {
            key: inner.key.clone(),
            timestamp: Utc::now(),
        });
        debug!(memory_id = %inner.key, messages = message_count, "Flush scheduled");

        let this = self.clone();
        inner.flush_tasks.spawn(async move {
            let cancel = this.inner.shutdown.child_token();
            let outcome = this.scheduled_flush(&cancel).await;
            this.inner.flush_pending.store(false, Ordering::SeqCst);
            match outcome {
                Ok(Some(_)) => {}
                Ok(None) => debug!(memory_id = %this.inner.key, "Below flush threshold"),
                Err(e) => warn!(
                    memory_id = %this.inner.key,
                    error = %e,
                    "Scheduled flush failed, list left unchanged"
                ),
            }
        });
    }

    /// Background flush: runs only when the conversation is over its
    /// threshold or message limit. `None` when nothing had to be done.
    async fn scheduled_flush(
        &self,
        cancel: &CancellationToken,
    ) -> MemoryResult<Option<FlushResult>> {
        let inner = &self.inner;
        let kind = inner.resource.flushing_strategy.kind;
        let lock = self.flush_lock(cancel).await?;
        let result = guarded(cancel, "flush", async {
            let messages = inner.store.read_messages(&inner.key).await?;
            let tokens = inner.tokens.total(&messages)?;
            let over_count = inner
                .resource
                .max_messages
                .is_some_and(|max| messages.len() > max);
            if !over_count && !inner.strategy.should_flush(tokens, inner.token_limit) {
                return Ok(None);
            }
            self.commit_flush(&lock, kind, messages).await.map(Some)
        })
        .await;
        self.finish_flush(lock, &result).await;
        result
    }

    /// Take the flush lock and keep it alive for the length of the flush.
    async fn flush_lock(&self, cancel: &CancellationToken) -> MemoryResult<HeldLock> {
        let mut lock = self.lock(self.inner.config.lock.flush_ttl(), cancel).await?;
        lock.start_refresh();
        Ok(lock)
    }

    async fn finish_flush<T>(&self, lock: HeldLock, result: &MemoryResult<T>) {
        if let Err(e) = result {
            error!(memory_id = %self.inner.key, error = %e, "Flush failed");
        }
        self.release(lock, "flush").await;
    }

    /// Flush `messages` and commit the result while `lock` is still held.
    async fn commit_flush(
        &self,
        lock: &HeldLock,
        kind: FlushingStrategyKind,
        messages: Vec<Message>,
    ) -> MemoryResult<FlushResult> {
        let inner = &self.inner;
        let ctx = FlushContext {
            resource: &inner.resource,
            counter: &inner.tokens,
            policy: inner.policy.as_ref(),
            resolver: &inner.resolver,
            token_limit: inner.token_limit,
        };
        let result = inner.strategy.flush_with(kind, messages, &ctx)?;

        if result.is_modified() {
            lock.validate().await?;
            inner
                .store
                .replace_messages(&inner.key, &result.messages)
                .await?;
            if let Some(ttl) = inner.config.ttl.after_flush() {
                self.extend_ttl(ttl, "flush").await;
            }
        }

        *inner.last_flush.write().await = Some(Utc::now());
        inner
            .stats
            .record_flush(result.summary_generated, result.evicted_count);
        inner.events.publish(MemoryEvent::Flushed {
            key: inner.key.clone(),
            strategy: kind.to_string(),
            summarized: result.summarized_count,
            evicted: result.evicted_count,
            tokens_before: result.tokens_before,
            tokens_after: result.token_count,
            timestamp: Utc::now(),
        });
        info!(
            memory_id = %inner.key,
            strategy = %kind,
            summarized = result.summarized_count,
            evicted = result.evicted_count,
            tokens_before = result.tokens_before,
            tokens = result.token_count,
            "Flush complete"
        );
        Ok(result)
    }

    // ========================================================================
    // Reads (lock-free)
    // ========================================================================

    /// All messages, oldest first.
    pub async fn read(&self, cancel: &CancellationToken) -> MemoryResult<Vec<Message>> {
        guarded(cancel, "read", self.inner.store.read_messages(&self.inner.key)).await
    }

    /// One page of messages plus the total count.
    pub async fn read_paginated(
        &self,
        offset: usize,
        limit: usize,
        cancel: &CancellationToken,
    ) -> MemoryResult<(Vec<Message>, usize)> {
        guarded(
            cancel,
            "read_paginated",
            self.inner
                .store
                .read_messages_paginated(&self.inner.key, offset, limit),
        )
        .await
    }

    /// Number of stored messages.
    pub async fn len(&self, cancel: &CancellationToken) -> MemoryResult<usize> {
        guarded(cancel, "len", self.inner.store.count_messages(&self.inner.key)).await
    }

    pub async fn is_empty(&self, cancel: &CancellationToken) -> MemoryResult<bool> {
        Ok(self.len(cancel).await? == 0)
    }

    /// Tokens across all stored messages.
    pub async fn token_count(&self, cancel: &CancellationToken) -> MemoryResult<usize> {
        let messages = self.read(cancel).await?;
        self.inner.tokens.total(&messages)
    }

    /// Diagnostic snapshot; may lag a concurrent writer.
    pub async fn health(&self, cancel: &CancellationToken) -> MemoryResult<MemoryHealth> {
        let messages = self.read(cancel).await?;
        Ok(MemoryHealth {
            token_count: self.inner.tokens.total(&messages)?,
            message_count: messages.len(),
            last_flush: *self.inner.last_flush.read().await,
            flush_strategy: self.inner.strategy.name().to_string(),
        })
    }

    /// Probe the store.
    pub async fn health_check(&self, cancel: &CancellationToken) -> MemoryResult<()> {
        guarded(cancel, "health_check", self.inner.store.ping()).await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn lock(&self, ttl: Duration, cancel: &CancellationToken) -> MemoryResult<HeldLock> {
        let inner = &self.inner;
        match inner.locks.acquire(&inner.key, ttl, cancel).await {
            Ok(lock) => {
                if lock.contended_attempts() > 0 {
                    inner.events.publish(MemoryEvent::LockContention {
                        key: inner.key.clone(),
                        attempts: lock.contended_attempts(),
                        timestamp: Utc::now(),
                    });
                }
                Ok(lock)
            }
            Err(e) => {
                if let MemoryError::LockTimeout { attempts, .. } = &e {
                    inner.stats.record_lock_timeout();
                    inner.events.publish(MemoryEvent::LockContention {
                        key: inner.key.clone(),
                        attempts: *attempts,
                        timestamp: Utc::now(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Release, logging failure. The guarded write already happened.
    async fn release(&self, lock: HeldLock, operation: &'static str) {
        if let Err(e) = lock.release().await {
            warn!(
                memory_id = %self.inner.key,
                operation,
                error = %e,
                "Lock release failed"
            );
        }
    }

    async fn extend_ttl(&self, ttl: Duration, operation: &'static str) {
        if let Err(e) = self.inner.store.set_expiration(&self.inner.key, ttl).await {
            warn!(
                memory_id = %self.inner.key,
                operation,
                error = %e,
                "Failed to set key TTL"
            );
        }
    }
}

/// Race `fut` against cancellation.
async fn guarded<T>(
    cancel: &CancellationToken,
    operation: &'static str,
    fut: impl Future<Output = MemoryResult<T>>,
) -> MemoryResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MemoryError::Cancelled { operation }),
        result = fut => result,
    }
}
