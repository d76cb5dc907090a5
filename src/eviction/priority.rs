//! Priority-aware eviction.
//!
//! Messages are grouped by resolved priority. Groups are drained from the
//! numerically highest priority (least important) down to 1, oldest first
//! within a group, until the kept total fits the limit. Priority 0 is never
//! drained. Before that, any priority block with a `max_tokens` ceiling has
//! its own group trimmed oldest-first to the ceiling.
use super::{
    EvictionDecision, EvictionPolicy, PriorityResolver, check_aligned, evict_oldest,
};
use crate::error::MemoryResult;
use crate::types::Message;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct PriorityPolicy {
    resolver: PriorityResolver,
}

impl PriorityPolicy {
    pub fn new(resolver: PriorityResolver) -> Self {
        Self { resolver }
    }

    /// Indices per priority, each in age order.
    fn groups(&self, messages: &[Message]) -> BTreeMap<u32, Vec<usize>> {
        let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (index, message) in messages.iter().enumerate() {
            groups
                .entry(self.resolver.resolve(message))
                .or_default()
                .push(index);
        }
        groups
    }
}

impl EvictionPolicy for PriorityPolicy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn select_eviction(
        &self,
        messages: &[Message],
        token_counts: &[usize],
        limit: usize,
    ) -> MemoryResult<EvictionDecision> {
        check_aligned(messages, token_counts)?;

        let groups = self.groups(messages);
        let mut evicted = vec![false; messages.len()];
        let mut remaining: usize = token_counts.iter().sum();

        for (priority, cap) in self.resolver.capped_blocks() {
            let Some(members) = groups.get(&priority) else {
                continue;
            };
            let group_tokens: usize = members.iter().map(|&i| token_counts[i]).sum();
            if group_tokens <= cap {
                continue;
            }
            let left = evict_oldest(
                members.iter().copied(),
                token_counts,
                &mut evicted,
                group_tokens,
                cap,
            );
            remaining -= group_tokens - left;
            debug!(priority, cap, trimmed = group_tokens - left, "Trimmed capped block");
        }

        for (_, members) in groups.iter().rev().filter(|(p, _)| **p != 0) {
            if remaining <= limit {
                break;
            }
            remaining = evict_oldest(
                members.iter().copied(),
                token_counts,
                &mut evicted,
                remaining,
                limit,
            );
        }

        if remaining > limit {
            debug!(
                remaining,
                limit, "Priority-0 messages alone exceed the token limit"
            );
        }

        let decision = EvictionDecision::from_mask(&evicted, token_counts);
        decision.verify(messages, &self.resolver)?;
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriorityBlock;

    fn block(priority: u32, types: &[&str], max_tokens: Option<usize>) -> PriorityBlock {
        PriorityBlock {
            priority,
            content_types: types.iter().map(|t| t.to_string()).collect(),
            max_tokens,
        }
    }

    #[test]
    fn test_least_important_group_goes_first() {
        let messages = vec![
            Message::user("old question"),
            Message::tool("tool output 1"),
            Message::assistant("answer"),
            Message::tool("tool output 2"),
        ];
        let policy = PriorityPolicy::new(PriorityResolver::new(vec![block(
            3,
            &["tool"],
            None,
        )]));
        let decision = policy
            .select_eviction(&messages, &[10, 10, 10, 10], 20)
            .unwrap();
        assert_eq!(decision.evict, vec![1, 3]);
        assert_eq!(decision.keep, vec![0, 2]);
    }

    #[test]
    fn test_partial_group_is_fifo() {
        let messages = vec![
            Message::user("a").with_priority(2),
            Message::user("b").with_priority(1),
            Message::user("c").with_priority(2),
            Message::user("d").with_priority(2),
        ];
        let decision = PriorityPolicy::default()
            .select_eviction(&messages, &[10, 10, 10, 10], 25)
            .unwrap();
        assert_eq!(decision.evict, vec![0, 2]);
        assert_eq!(decision.kept_tokens, 20);
    }

    #[test]
    fn test_system_message_kept_under_pressure() {
        let messages = vec![
            Message::system("policy"),
            Message::user("u1"),
            Message::assistant("a1"),
            Message::user("u2"),
        ];
        let decision = PriorityPolicy::default()
            .select_eviction(&messages, &[50, 30, 30, 30], 60)
            .unwrap();
        assert!(decision.keep.contains(&0));
        assert!(decision.kept_tokens <= 60);
        assert_eq!(decision.keep, vec![0]);
    }

    #[test]
    fn test_capped_block_trimmed_even_under_limit() {
        let messages = vec![
            Message::tool("r1"),
            Message::tool("r2"),
            Message::tool("r3"),
            Message::user("q"),
        ];
        let policy = PriorityPolicy::new(PriorityResolver::new(vec![block(
            2,
            &["tool"],
            Some(20),
        )]));
        let decision = policy
            .select_eviction(&messages, &[10, 10, 10, 10], 1_000)
            .unwrap();
        assert_eq!(decision.evict, vec![0]);
        assert_eq!(decision.kept_tokens, 30);
    }

    #[test]
    fn test_important_content_outlives_less_important() {
        let messages = vec![
            Message::user("keep longer").with_priority(1),
            Message::user("drop first").with_priority(5),
        ];
        let decision = PriorityPolicy::default()
            .select_eviction(&messages, &[10, 10], 10)
            .unwrap();
        assert_eq!(decision.keep, vec![0]);
    }
}
