//! Oldest-first eviction.
use super::{
    EvictionDecision, EvictionPolicy, PriorityResolver, check_aligned, evict_oldest,
};
use crate::error::MemoryResult;
use crate::types::Message;
use tracing::debug;

/// Evicts from the oldest message forward, skipping priority-0 messages.
///
/// Equal-age ties are broken by insertion index, which is simply list order.
#[derive(Debug, Clone, Default)]
pub struct FifoPolicy {
    resolver: PriorityResolver,
}

impl FifoPolicy {
    pub fn new(resolver: PriorityResolver) -> Self {
        Self { resolver }
    }
}

impl EvictionPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn select_eviction(
        &self,
        messages: &[Message],
        token_counts: &[usize],
        limit: usize,
    ) -> MemoryResult<EvictionDecision> {
        check_aligned(messages, token_counts)?;

        let total: usize = token_counts.iter().sum();
        if total <= limit {
            return Ok(EvictionDecision::keep_all(token_counts));
        }

        let mut evicted = vec![false; messages.len()];
        let candidates = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| !self.resolver.is_protected(m))
            .map(|(i, _)| i);
        let remaining = evict_oldest(candidates, token_counts, &mut evicted, total, limit);
        if remaining > limit {
            debug!(
                remaining,
                limit, "Protected messages alone exceed the token limit"
            );
        }

        let decision = EvictionDecision::from_mask(&evicted, token_counts);
        decision.verify(messages, &self.resolver)?;
        Ok(decision)
    }
}
