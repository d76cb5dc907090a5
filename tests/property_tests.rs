//! Property-based tests for eviction, budgets and flushing

use membudget::tokens::classify;
use membudget::{
    AllocationClass, CharRatioCounter, EvictionPolicy, FifoPolicy, FlushContext,
    FlushingStrategyConfig, FlushingStrategyKind, HybridFlushStrategy, MemoryResource, Message,
    PriorityBlock, PriorityPolicy, PriorityResolver, Role, TokenAllocation, TokenBudgetAllocator,
    TokenCountService,
};
use proptest::prelude::*;
use std::sync::Arc;

fn chars() -> TokenCountService {
    TokenCountService::new(Arc::new(CharRatioCounter::new(1)), None).unwrap()
}

fn tool_block(cap: Option<usize>) -> PriorityBlock {
    PriorityBlock {
        priority: 3,
        content_types: vec!["tool".into()],
        max_tokens: cap,
    }
}

// Generate arbitrary roles, mostly non-system
prop_compose! {
    fn arb_role()(idx in 0..10usize) -> Role {
        match idx {
            0 => Role::System,
            1 | 2 => Role::Tool,
            3..=5 => Role::Assistant,
            _ => Role::User,
        }
    }
}

// Generate arbitrary messages, some with an explicit priority
prop_compose! {
    fn arb_message()(
        role in arb_role(),
        len in 1..80usize,
        explicit in prop::option::weighted(0.2, 0..4u32)
    ) -> Message {
        let message = Message::new(role, "m".repeat(len));
        match explicit {
            Some(priority) => message.with_priority(priority),
            None => message,
        }
    }
}

// Generate arbitrary conversations
prop_compose! {
    fn arb_conversation(max: usize)(
        messages in prop::collection::vec(arb_message(), 0..max)
    ) -> Vec<Message> {
        messages
    }
}

// Generate arbitrary allocations whose ratios sum to at most 1
prop_compose! {
    fn arb_allocation()(
        short_term in 0..=40u32,
        long_term in 0..=30u32,
        system in 0..=30u32
    ) -> TokenAllocation {
        TokenAllocation {
            short_term: short_term as f64 / 100.0,
            long_term: long_term as f64 / 100.0,
            system: system as f64 / 100.0,
            ..Default::default()
        }
    }
}

fn counts(messages: &[Message]) -> Vec<usize> {
    chars().count_messages(messages).unwrap()
}

proptest! {
    #[test]
    fn test_eviction_respects_priority_zero_and_budget(
        messages in arb_conversation(40),
        limit in 0..1500usize,
        use_priority in any::<bool>(),
        cap in prop::option::of(0..200usize),
    ) {
        let resolver = PriorityResolver::new(vec![tool_block(cap)]);
        let policy: Box<dyn EvictionPolicy> = if use_priority {
            Box::new(PriorityPolicy::new(resolver.clone()))
        } else {
            Box::new(FifoPolicy::new(resolver.clone()))
        };
        let token_counts = counts(&messages);

        let decision = policy.select_eviction(&messages, &token_counts, limit).unwrap();

        // Partition of all indices, each side ascending
        let mut all: Vec<usize> = decision.keep.iter().chain(&decision.evict).copied().collect();
        all.sort_unstable();
        prop_assert_eq!(all, (0..messages.len()).collect::<Vec<_>>());
        prop_assert!(decision.keep.windows(2).all(|w| w[0] < w[1]));

        for &i in &decision.evict {
            prop_assert!(!resolver.is_protected(&messages[i]));
        }

        let kept = decision.apply(&messages);
        let kept_tokens: usize = decision.keep.iter().map(|&i| token_counts[i]).sum();
        prop_assert_eq!(kept_tokens, decision.kept_tokens);
        prop_assert!(
            kept_tokens <= limit || kept.iter().all(|m| resolver.is_protected(m)),
            "over budget with evictable messages left: {} > {}", kept_tokens, limit
        );
    }

    #[test]
    fn test_fifo_evicts_oldest_first(
        messages in arb_conversation(40),
        limit in 0..1500usize,
    ) {
        let resolver = PriorityResolver::default();
        let token_counts = counts(&messages);
        let decision = FifoPolicy::new(resolver.clone())
            .select_eviction(&messages, &token_counts, limit)
            .unwrap();

        // Among evictable messages, the evicted ones form a prefix
        let evictable: Vec<usize> = (0..messages.len())
            .filter(|&i| !resolver.is_protected(&messages[i]))
            .collect();
        let evicted = decision.evict.len();
        prop_assert_eq!(&decision.evict[..], &evictable[..evicted]);
    }

    #[test]
    fn test_priority_drains_least_important_first(
        messages in arb_conversation(40),
        limit in 0..1500usize,
    ) {
        let resolver = PriorityResolver::new(vec![tool_block(None)]);
        let token_counts = counts(&messages);
        let decision = PriorityPolicy::new(resolver.clone())
            .select_eviction(&messages, &token_counts, limit)
            .unwrap();

        // Any survivor ranks at least as important as every evicted message
        let lowest_evicted = decision
            .evict
            .iter()
            .map(|&i| resolver.resolve(&messages[i]))
            .min();
        if let Some(lowest) = lowest_evicted {
            for &i in &decision.keep {
                let priority = resolver.resolve(&messages[i]);
                prop_assert!(priority == 0 || priority <= lowest);
            }
        }
    }

    #[test]
    fn test_class_limit_is_min_of_ratio_and_block_cap(
        allocation in arb_allocation(),
        effective in 1..100_000usize,
        cap in prop::option::of(0..5_000usize),
    ) {
        let mut resource = MemoryResource::with_max_tokens("prop", effective);
        resource.priority_blocks = vec![PriorityBlock {
            priority: 2,
            content_types: vec!["short_term".into()],
            max_tokens: cap,
        }];
        resource.token_allocation = Some(allocation.clone());

        let allocator = TokenBudgetAllocator::new();
        let limit = allocator
            .class_limit_for(&resource, &AllocationClass::ShortTerm, effective)
            .unwrap();
        let by_ratio = (effective as f64 * allocation.short_term).floor() as usize;
        prop_assert_eq!(limit, cap.map_or(by_ratio, |c| by_ratio.min(c)));

        let long_term = allocator
            .class_limit_for(&resource, &AllocationClass::LongTerm, effective)
            .unwrap();
        prop_assert_eq!(long_term, (effective as f64 * allocation.long_term).floor() as usize);
    }

    #[test]
    fn test_classification_is_total(message in arb_message()) {
        let resource = MemoryResource::with_max_tokens("prop", 100);
        let class = classify(&message, &resource);
        if message.role == Role::System {
            prop_assert_eq!(class, AllocationClass::System);
        } else {
            prop_assert_eq!(class, AllocationClass::ShortTerm);
        }
    }

    #[test]
    fn test_small_share_skips_summary_but_still_evicts(
        messages in arb_conversation(7),
        limit in 1..50usize,
    ) {
        // 30% of fewer than 7 messages rounds down to at most one
        let resource = MemoryResource::with_max_tokens("prop", limit);
        let counter = chars();
        let resolver = PriorityResolver::default();
        let policy = FifoPolicy::new(resolver.clone());
        let ctx = FlushContext {
            resource: &resource,
            counter: &counter,
            policy: &policy,
            resolver: &resolver,
            token_limit: limit,
        };

        let expected = policy
            .select_eviction(&messages, &counts(&messages), limit)
            .unwrap()
            .apply(&messages);
        let result = HybridFlushStrategy::new(FlushingStrategyConfig::default())
            .flush(messages, &ctx)
            .unwrap();
        prop_assert!(!result.summary_generated);
        prop_assert_eq!(result.summarized_count, 0);
        prop_assert_eq!(result.messages, expected);
    }

    #[test]
    fn test_flush_never_grows_and_fits_budget(
        messages in arb_conversation(60),
        limit in 1..2_000usize,
        percent in 0..=100u32,
        simple in any::<bool>(),
    ) {
        let resource = MemoryResource::with_max_tokens("prop", limit);
        let counter = chars();
        let resolver = PriorityResolver::default();
        let policy = FifoPolicy::new(resolver.clone());
        let ctx = FlushContext {
            resource: &resource,
            counter: &counter,
            policy: &policy,
            resolver: &resolver,
            token_limit: limit,
        };
        let strategy = HybridFlushStrategy::new(FlushingStrategyConfig {
            summarize_oldest_percent: percent,
            ..Default::default()
        });
        let kind = if simple {
            FlushingStrategyKind::SimpleFifo
        } else {
            FlushingStrategyKind::HybridSummary
        };

        let protected_before = messages.iter().filter(|m| resolver.is_protected(m)).count();
        let result = strategy.flush_with(kind, messages, &ctx).unwrap();

        prop_assert!(result.token_count <= result.tokens_before);
        prop_assert_eq!(result.token_count, counter.total(&result.messages).unwrap());
        prop_assert!(
            result.token_count <= limit
                || result.messages.iter().all(|m| resolver.is_protected(m))
        );
        prop_assert!(result.messages.iter().filter(|m| m.is_summary()).count() <= 1);

        // Protected originals survive; summaries are never protected
        let protected_after = result
            .messages
            .iter()
            .filter(|m| resolver.is_protected(m))
            .count();
        prop_assert_eq!(protected_after, protected_before);
    }
}
