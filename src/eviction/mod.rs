//! Eviction policies.
//!
//! A policy looks at the message list, the index-aligned token counts and a
//! token limit, and partitions the list into messages to keep and messages
//! to evict. Policies never touch storage; the orchestrator applies the
//! decision through an atomic replace.
//!
//! Priority 0 is sacred under every policy: a decision that evicts a
//! priority-0 message is rejected with
//! [`MemoryError::EvictionInvariantViolation`] before it leaves the policy.
pub mod fifo;
pub mod priority;

use crate::config::{EvictionPolicyKind, MemoryResource, PriorityBlock};
use crate::error::{MemoryError, MemoryResult};
use crate::types::{Message, Role};
use std::sync::Arc;

pub use fifo::FifoPolicy;
pub use priority::PriorityPolicy;

/// Priority assumed for messages nothing else classifies.
pub const DEFAULT_PRIORITY: u32 = 1;

/// Selects which messages to drop to get under a token limit.
pub trait EvictionPolicy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Partition `messages` so the kept tokens fit `limit`.
    ///
    /// If the never-evictable messages alone exceed `limit`, everything else
    /// is evicted and the decision still keeps them.
    fn select_eviction(
        &self,
        messages: &[Message],
        token_counts: &[usize],
        limit: usize,
    ) -> MemoryResult<EvictionDecision>;
}

/// Resolves the effective eviction priority of a message.
///
/// Order: explicit `metadata.priority`; synthesized summaries take
/// [`DEFAULT_PRIORITY`]; system role is 0; the first
/// configured block whose `content_types` names the role or the message's
/// content type; otherwise [`DEFAULT_PRIORITY`].
#[derive(Debug, Clone, Default)]
pub struct PriorityResolver {
    blocks: Vec<PriorityBlock>,
}

impl PriorityResolver {
    pub fn new(blocks: Vec<PriorityBlock>) -> Self {
        Self { blocks }
    }

    pub fn from_resource(resource: &MemoryResource) -> Self {
        Self::new(resource.priority_blocks.clone())
    }

    pub fn resolve(&self, message: &Message) -> u32 {
        if let Some(priority) = message.priority() {
            return priority;
        }
        // Summaries are folded by the next flush, never pinned.
        if message.is_summary() {
            return DEFAULT_PRIORITY;
        }
        if message.role == Role::System {
            return 0;
        }
        let role = message.role.as_str();
        let content_type = message.content_type();
        self.blocks
            .iter()
            .find(|b| b.covers(role) || content_type.is_some_and(|ct| b.covers(ct)))
            .map(|b| b.priority)
            .unwrap_or(DEFAULT_PRIORITY)
    }

    pub fn is_protected(&self, message: &Message) -> bool {
        self.resolve(message) == 0
    }

    /// Configured blocks that carry a token ceiling, excluding priority 0.
    pub fn capped_blocks(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.blocks
            .iter()
            .filter(|b| b.priority != 0)
            .filter_map(|b| b.max_tokens.map(|cap| (b.priority, cap)))
    }
}

/// Partition of a message list produced by a policy.
///
/// `keep` and `evict` hold indices into the input list, both ascending, and
/// together cover every index exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EvictionDecision {
    pub keep: Vec<usize>,
    pub evict: Vec<usize>,
    pub kept_tokens: usize,
    pub evicted_tokens: usize,
}

impl EvictionDecision {
    /// Keep everything.
    pub fn keep_all(token_counts: &[usize]) -> Self {
        Self {
            keep: (0..token_counts.len()).collect(),
            evict: Vec::new(),
            kept_tokens: token_counts.iter().sum(),
            evicted_tokens: 0,
        }
    }

    /// Build from a per-index eviction mask.
    pub fn from_mask(evicted: &[bool], token_counts: &[usize]) -> Self {
        let mut decision = Self::default();
        for (index, (&gone, &tokens)) in evicted.iter().zip(token_counts).enumerate() {
            if gone {
                decision.evict.push(index);
                decision.evicted_tokens += tokens;
            } else {
                decision.keep.push(index);
                decision.kept_tokens += tokens;
            }
        }
        decision
    }

    pub fn is_noop(&self) -> bool {
        self.evict.is_empty()
    }

    /// The kept messages, in original order.
    pub fn apply(&self, messages: &[Message]) -> Vec<Message> {
        self.keep
            .iter()
            .filter_map(|&i| messages.get(i).cloned())
            .collect()
    }

    /// Fail if any evicted message resolves to priority 0.
    pub fn verify(&self, messages: &[Message], resolver: &PriorityResolver) -> MemoryResult<()> {
        for &index in &self.evict {
            if let Some(message) = messages.get(index)
                && resolver.is_protected(message)
            {
                return Err(MemoryError::EvictionInvariantViolation {
                    index,
                    reason: format!("{} message has priority 0", message.role),
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn check_aligned(messages: &[Message], token_counts: &[usize]) -> MemoryResult<()> {
    if messages.len() != token_counts.len() {
        return Err(MemoryError::EvictionInvariantViolation {
            index: messages.len().min(token_counts.len()),
            reason: format!(
                "{} messages but {} token counts",
                messages.len(),
                token_counts.len()
            ),
        });
    }
    Ok(())
}

/// Evict oldest evictable messages in `candidates` until `remaining <= limit`.
///
/// `candidates` must be in age order. Returns the tokens left afterwards.
pub(crate) fn evict_oldest(
    candidates: impl IntoIterator<Item = usize>,
    token_counts: &[usize],
    evicted: &mut [bool],
    mut remaining: usize,
    limit: usize,
) -> usize {
    for index in candidates {
        if remaining <= limit {
            break;
        }
        if evicted[index] {
            continue;
        }
        evicted[index] = true;
        remaining -= token_counts[index];
    }
    remaining
}

/// Drop the oldest evictable messages until at most `max_messages` remain.
pub fn enforce_max_messages(
    messages: &[Message],
    token_counts: &[usize],
    max_messages: usize,
    resolver: &PriorityResolver,
) -> MemoryResult<EvictionDecision> {
    check_aligned(messages, token_counts)?;
    let mut evicted = vec![false; messages.len()];
    let mut remaining = messages.len();
    for (index, message) in messages.iter().enumerate() {
        if remaining <= max_messages {
            break;
        }
        if resolver.is_protected(message) {
            continue;
        }
        evicted[index] = true;
        remaining -= 1;
    }
    let decision = EvictionDecision::from_mask(&evicted, token_counts);
    decision.verify(messages, resolver)?;
    Ok(decision)
}

/// Build the policy configured on a resource.
pub fn policy_for(resource: &MemoryResource) -> Arc<dyn EvictionPolicy> {
    let resolver = PriorityResolver::from_resource(resource);
    match resource.eviction_policy {
        EvictionPolicyKind::Fifo => Arc::new(FifoPolicy::new(resolver)),
        EvictionPolicyKind::Priority => Arc::new(PriorityPolicy::new(resolver)),
    }
}
