//! Flushing: deciding when to shrink a conversation and doing it.
//!
//! The cheap gate ([`HybridFlushStrategy::should_check_flush`]) runs on every
//! append and only looks at the message count. The threshold check
//! ([`HybridFlushStrategy::should_flush`]) needs a token count and runs only
//! when the gate opens. [`HybridFlushStrategy::flush`] is pure: it takes the
//! current list and returns the list to commit.
pub mod summarizer;

use crate::config::{
    DEFAULT_FLUSH_CHECK_MIN_MESSAGES, FlushingStrategyConfig, FlushingStrategyKind,
    MemoryResource,
};
use crate::error::MemoryResult;
use crate::eviction::{
    EvictionDecision, EvictionPolicy, FifoPolicy, PriorityResolver, enforce_max_messages,
    evict_oldest,
};
use crate::tokens::{TokenBudgetAllocator, TokenCountService, classify};
use crate::types::{FlushResult, Message};
use tracing::debug;

pub use summarizer::RuleBasedSummarizer;

/// Everything a flush needs besides the messages.
pub struct FlushContext<'a> {
    pub resource: &'a MemoryResource,
    pub counter: &'a TokenCountService,
    pub policy: &'a dyn EvictionPolicy,
    pub resolver: &'a PriorityResolver,
    /// Effective token ceiling of the instance.
    pub token_limit: usize,
}

/// Summarize-then-evict flushing.
#[derive(Debug, Clone)]
pub struct HybridFlushStrategy {
    config: FlushingStrategyConfig,
    check_min_messages: usize,
    summarizer: RuleBasedSummarizer,
}

impl HybridFlushStrategy {
    pub fn new(config: FlushingStrategyConfig) -> Self {
        Self {
            config,
            check_min_messages: DEFAULT_FLUSH_CHECK_MIN_MESSAGES,
            summarizer: RuleBasedSummarizer::default(),
        }
    }

    pub fn with_check_min_messages(mut self, min: usize) -> Self {
        self.check_min_messages = min;
        self
    }

    pub fn with_summarizer(mut self, summarizer: RuleBasedSummarizer) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn config(&self) -> &FlushingStrategyConfig {
        &self.config
    }

    /// Name of the configured strategy.
    pub fn name(&self) -> &'static str {
        self.config.kind.as_str()
    }

    /// Cheap gate: small conversations are never token-counted on append.
    pub fn should_check_flush(&self, message_count: usize) -> bool {
        message_count >= self.check_min_messages
    }

    /// `tokens >= floor(limit * threshold)`.
    pub fn should_flush(&self, tokens: usize, limit: usize) -> bool {
        if limit == 0 {
            return false;
        }
        let threshold_tokens = (limit as f64 * self.config.threshold).floor() as usize;
        tokens >= threshold_tokens
    }

    /// Flush with the configured strategy.
    pub fn flush(&self, messages: Vec<Message>, ctx: &FlushContext<'_>) -> MemoryResult<FlushResult> {
        self.flush_with(self.config.kind, messages, ctx)
    }

    /// Flush with an explicit strategy.
    ///
    /// `HybridSummary` folds the oldest `summarize_oldest_percent` of the
    /// messages into one summary. If that share is one message or less the
    /// summary step is skipped. `SimpleFifo` never summarizes. Either way
    /// token eviction runs afterwards.
    pub fn flush_with(
        &self,
        kind: FlushingStrategyKind,
        messages: Vec<Message>,
        ctx: &FlushContext<'_>,
    ) -> MemoryResult<FlushResult> {
        let counts = ctx.counter.count_messages(&messages)?;
        let tokens_before: usize = counts.iter().sum();

        let (mut retained, summarized_count) = match kind {
            FlushingStrategyKind::HybridSummary => {
                let summarize_count = messages.len()
                    * self.config.summarize_oldest_percent as usize
                    / 100;
                if summarize_count <= 1 {
                    debug!(
                        messages = messages.len(),
                        summarize_count, "Nothing meaningful to summarize"
                    );
                    (messages, 0)
                } else {
                    self.summarize_oldest(messages, &counts, summarize_count, ctx)?
                }
            }
            FlushingStrategyKind::SimpleFifo => (messages, 0),
        };

        let fifo;
        let policy: &dyn EvictionPolicy = match kind {
            FlushingStrategyKind::HybridSummary => ctx.policy,
            FlushingStrategyKind::SimpleFifo => {
                fifo = FifoPolicy::new(ctx.resolver.clone());
                &fifo
            }
        };

        let mut evicted_count = 0;

        let counts = ctx.counter.count_messages(&retained)?;
        let decision = policy.select_eviction(&retained, &counts, ctx.token_limit)?;
        evicted_count += apply(&mut retained, &decision);

        let decision = enforce_class_limits(&retained, ctx)?;
        evicted_count += apply(&mut retained, &decision);

        if let Some(max_messages) = ctx.resource.max_messages {
            let counts = ctx.counter.count_messages(&retained)?;
            let decision = enforce_max_messages(&retained, &counts, max_messages, ctx.resolver)?;
            evicted_count += apply(&mut retained, &decision);
        }

        let token_count = ctx.counter.total(&retained)?;
        Ok(FlushResult {
            messages: retained,
            summarized_count,
            evicted_count,
            summary_generated: summarized_count > 0,
            tokens_before,
            token_count,
            tokens_reclaimed: tokens_before.saturating_sub(token_count),
        })
    }

    /// Replace the unprotected messages among the oldest `summarize_count`
    /// with one summary. Protected messages of the segment stay in place
    /// ahead of the summary.
    fn summarize_oldest(
        &self,
        messages: Vec<Message>,
        counts: &[usize],
        summarize_count: usize,
        ctx: &FlushContext<'_>,
    ) -> MemoryResult<(Vec<Message>, usize)> {
        let mut pinned = Vec::new();
        let mut segment = Vec::new();
        let mut segment_tokens = 0;
        for (message, &tokens) in messages[..summarize_count].iter().zip(counts) {
            if ctx.resolver.is_protected(message) {
                pinned.push(message.clone());
            } else {
                segment_tokens += tokens;
                segment.push(message.clone());
            }
        }

        let Some(summary) =
            self.summarizer
                .summary_message(&segment, self.config.summary_tokens, ctx.counter)?
        else {
            return Ok((messages, 0));
        };

        let summary_tokens = ctx.counter.count_message(&summary)?;
        if summary_tokens >= segment_tokens {
            debug!(
                summary_tokens,
                segment_tokens, "Summary would not save tokens, skipping"
            );
            return Ok((messages, 0));
        }

        let summarized = segment.len();
        let mut retained = pinned;
        retained.push(summary);
        retained.extend(messages.into_iter().skip(summarize_count));
        Ok((retained, summarized))
    }
}

fn apply(messages: &mut Vec<Message>, decision: &EvictionDecision) -> usize {
    if decision.is_noop() {
        return 0;
    }
    *messages = decision.apply(messages);
    decision.evict.len()
}

/// Trim every allocation class to its limit, oldest unprotected first.
fn enforce_class_limits(
    messages: &[Message],
    ctx: &FlushContext<'_>,
) -> MemoryResult<EvictionDecision> {
    let counts = ctx.counter.count_messages(messages)?;
    let limits = TokenBudgetAllocator::new().class_limits(ctx.resource, ctx.token_limit)?;
    if limits.is_empty() {
        return Ok(EvictionDecision::keep_all(&counts));
    }

    let classes: Vec<_> = messages.iter().map(|m| classify(m, ctx.resource)).collect();
    let mut evicted = vec![false; messages.len()];
    for (class, limit) in limits {
        let members: Vec<usize> = (0..messages.len()).filter(|&i| classes[i] == class).collect();
        let used: usize = members.iter().map(|&i| counts[i]).sum();
        if used <= limit {
            continue;
        }
        let candidates = members
            .into_iter()
            .filter(|&i| !ctx.resolver.is_protected(&messages[i]));
        let left = evict_oldest(candidates, &counts, &mut evicted, used, limit);
        debug!(class = %class, used, limit, left, "Enforced allocation class limit");
    }

    let decision = EvictionDecision::from_mask(&evicted, &counts);
    decision.verify(messages, ctx.resolver)?;
    Ok(decision)
}
