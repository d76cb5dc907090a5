//! # membudget: token-bounded conversation memory
//!
//! membudget keeps an agent's conversation history inside a token budget:
//! - **Token accounting** - exact BPE counts via tiktoken, with a fallback encoding
//! - **Budgets** - absolute ceilings or a share of the model's context window
//! - **Eviction** - FIFO or priority-aware, priority 0 is never dropped
//! - **Flushing** - deterministic rule-based summaries of the oldest turns
//! - **Cross-process safety** - per-key locks with TTL refresh
//!
//! ## Quick Start
//!
//! ```ignore
//! use membudget::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let resource = MemoryResource::with_max_tokens("support_chat", 4000);
//!     let memory = MemoryInstance::builder(StorageKey::new("support:42")?, resource).build()?;
//!     let cancel = CancellationToken::new();
//!
//!     memory.append(Message::system("You are a support agent."), &cancel).await?;
//!     memory.append(Message::user("My invoice is wrong."), &cancel).await?;
//!
//!     let health = memory.health(&cancel).await?;
//!     println!("{} messages, {} tokens", health.message_count, health.token_count);
//!     Ok(())
//! }
//! ```
//!
//! ## Core API
//!
//! - [`MemoryInstance::append()`] - persist a message, maybe schedule a flush
//! - [`MemoryInstance::read()`] - the whole conversation
//! - [`MemoryInstance::token_count()`] - tokens currently stored
//! - [`MemoryInstance::health()`] - lock-free diagnostic snapshot
//! - [`MemoryInstance::flush()`] - summarize and evict now
//! - [`MemoryInstance::clear()`] - drop the conversation
//!
//! ## Architecture
//!
//! 1. **Orchestrator** (`instance`) - lock lifecycle, flush scheduling
//! 2. **Policy** (`tokens`, `eviction`, `flush`) - pure functions over message lists
//! 3. **Collaborators** (`store`, `lock`) - traits with in-process and
//!    directory-backed implementations
//!
//! ## Thread Safety
//!
//! A `MemoryInstance` is a cheap `Arc` handle. Clone it into as many tasks
//! as needed; writes to one storage key are serialized by the lock backend.

pub mod config;
pub mod error;
pub mod events;
pub mod eviction;
pub mod flush;
pub mod instance;
pub mod key;
pub mod lock;
pub mod registry;
pub mod store;
pub mod tokens;
pub mod types;

// Public API exports
pub use config::{
    AllocationClass, EvictionPolicyKind, FlushingStrategyConfig, FlushingStrategyKind,
    InstanceConfig, LockConfig, MemoryResource, PriorityBlock, TokenAllocation, TtlConfig,
};
pub use error::{MemoryError, MemoryResult};
pub use events::{EventBus, MemoryEvent, StatsSnapshot};
pub use eviction::{EvictionDecision, EvictionPolicy, FifoPolicy, PriorityPolicy, PriorityResolver};
pub use flush::{FlushContext, HybridFlushStrategy, RuleBasedSummarizer};
pub use instance::{MemoryInstance, MemoryInstanceBuilder};
pub use key::StorageKey;
pub use lock::{FileLockBackend, HeldLock, InMemoryLockBackend, LockBackend, LockManager};
pub use registry::MemoryRegistry;
pub use store::{InMemoryStore, JsonFileStore, MemoryStore};
pub use tokens::{
    CharRatioCounter, TiktokenCounter, TokenBudgetAllocator, TokenCountService, TokenCounter,
};
pub use types::{FlushResult, MemoryHealth, Message, MessageMetadata, Role};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use membudget::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{
        EvictionPolicyKind, FlushingStrategyKind, InstanceConfig, MemoryResource, PriorityBlock,
        TokenAllocation,
    };
    pub use crate::error::{MemoryError, MemoryResult};
    pub use crate::instance::MemoryInstance;
    pub use crate::key::StorageKey;
    pub use crate::registry::MemoryRegistry;
    pub use crate::types::{FlushResult, MemoryHealth, Message, Role};
}
