//! Configuration for memory resources and runtime behaviour.
//!
//! A [`MemoryResource`] describes one kind of memory (its token ceiling,
//! priority blocks, allocation ratios and flushing strategy). Resources are
//! loaded by the caller, typically from the project's JSON resource files,
//! and consumed read-only here. [`LockConfig`] and [`TtlConfig`] hold the
//! timing knobs of the orchestrator.
use crate::error::{MemoryError, MemoryResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Default flush threshold as a fraction of the token limit.
pub const DEFAULT_FLUSH_THRESHOLD: f64 = 0.8;

/// Default token target for synthesized summaries.
pub const DEFAULT_SUMMARY_TOKENS: usize = 500;

/// Default share of the oldest messages folded into a summary.
pub const DEFAULT_SUMMARIZE_OLDEST_PERCENT: u32 = 30;

/// Conversations shorter than this never trigger a token count on append.
pub const DEFAULT_FLUSH_CHECK_MIN_MESSAGES: usize = 10;

/// Trailing messages of the summarized segment quoted in the summary.
pub const DEFAULT_SUMMARY_KEEP_LAST: usize = 2;

/// Tolerance for float sums of allocation ratios.
const RATIO_EPSILON: f64 = 1e-9;

/// Which messages to remove when the budget is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicyKind {
    /// Oldest first.
    #[default]
    Fifo,
    /// Least important priority group first, oldest first within a group.
    Priority,
}

/// How a flush shrinks the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushingStrategyKind {
    /// Summarize the oldest segment, then evict if still over budget.
    #[default]
    HybridSummary,
    /// Evict only.
    SimpleFifo,
}

impl FlushingStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushingStrategyKind::HybridSummary => "hybrid_summary",
            FlushingStrategyKind::SimpleFifo => "simple_fifo",
        }
    }
}

impl std::fmt::Display for FlushingStrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured class of content with an eviction rank and optional ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityBlock {
    /// Eviction rank; 0 is never evicted, larger numbers are evicted first.
    pub priority: u32,
    /// Roles, content types or allocation class names covered by this block.
    #[serde(default)]
    pub content_types: Vec<String>,
    /// Token ceiling for the messages of this block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

impl PriorityBlock {
    pub fn covers(&self, name: &str) -> bool {
        self.content_types.iter().any(|t| t == name)
    }
}

/// Budget class a message is accounted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocationClass {
    ShortTerm,
    LongTerm,
    System,
    UserDefined(String),
}

impl AllocationClass {
    pub fn name(&self) -> &str {
        match self {
            AllocationClass::ShortTerm => "short_term",
            AllocationClass::LongTerm => "long_term",
            AllocationClass::System => "system",
            AllocationClass::UserDefined(name) => name,
        }
    }
}

impl std::fmt::Display for AllocationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Ratios splitting the effective token limit across classes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenAllocation {
    #[serde(default)]
    pub short_term: f64,
    #[serde(default)]
    pub long_term: f64,
    #[serde(default)]
    pub system: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_defined: BTreeMap<String, f64>,
}

impl TokenAllocation {
    /// Ratio configured for a class; `None` for an unknown user-defined class.
    pub fn ratio(&self, class: &AllocationClass) -> Option<f64> {
        match class {
            AllocationClass::ShortTerm => Some(self.short_term),
            AllocationClass::LongTerm => Some(self.long_term),
            AllocationClass::System => Some(self.system),
            AllocationClass::UserDefined(name) => self.user_defined.get(name).copied(),
        }
    }

    /// All classes with their ratios, built-ins first.
    pub fn classes(&self) -> Vec<(AllocationClass, f64)> {
        let mut classes = vec![
            (AllocationClass::ShortTerm, self.short_term),
            (AllocationClass::LongTerm, self.long_term),
            (AllocationClass::System, self.system),
        ];
        for (name, ratio) in &self.user_defined {
            classes.push((AllocationClass::UserDefined(name.clone()), *ratio));
        }
        classes
    }

    /// Ratios must each lie in [0, 1] and sum to at most 1.0.
    pub fn validate(&self) -> MemoryResult<()> {
        let mut sum = 0.0;
        for (class, ratio) in self.classes() {
            if !(0.0..=1.0).contains(&ratio) || ratio.is_nan() {
                return Err(MemoryError::config(format!(
                    "token_allocation.{} must be within [0, 1], got {}",
                    class, ratio
                )));
            }
            sum += ratio;
        }
        if sum > 1.0 + RATIO_EPSILON {
            return Err(MemoryError::config(format!(
                "token_allocation ratios must sum to at most 1.0, got {}",
                sum
            )));
        }
        Ok(())
    }
}

/// When and how much to flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushingStrategyConfig {
    #[serde(default, rename = "type")]
    pub kind: FlushingStrategyKind,
    /// Fraction of the token limit at which a flush runs, in (0, 1].
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Token target for the synthesized summary.
    #[serde(default = "default_summary_tokens")]
    pub summary_tokens: usize,
    /// Percentage of the oldest messages to summarize, in [0, 100].
    #[serde(default = "default_summarize_oldest_percent")]
    pub summarize_oldest_percent: u32,
}

fn default_threshold() -> f64 {
    DEFAULT_FLUSH_THRESHOLD
}

fn default_summary_tokens() -> usize {
    DEFAULT_SUMMARY_TOKENS
}

fn default_summarize_oldest_percent() -> u32 {
    DEFAULT_SUMMARIZE_OLDEST_PERCENT
}

impl Default for FlushingStrategyConfig {
    fn default() -> Self {
        Self {
            kind: FlushingStrategyKind::default(),
            threshold: DEFAULT_FLUSH_THRESHOLD,
            summary_tokens: DEFAULT_SUMMARY_TOKENS,
            summarize_oldest_percent: DEFAULT_SUMMARIZE_OLDEST_PERCENT,
        }
    }
}

impl FlushingStrategyConfig {
    pub fn validate(&self) -> MemoryResult<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(MemoryError::config(format!(
                "flushing_strategy.threshold must be within (0, 1], got {}",
                self.threshold
            )));
        }
        if self.summarize_oldest_percent > 100 {
            return Err(MemoryError::config(format!(
                "flushing_strategy.summarize_oldest_percent must be within [0, 100], got {}",
                self.summarize_oldest_percent
            )));
        }
        Ok(())
    }
}

/// Static configuration of one memory kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryResource {
    pub id: String,
    /// Model name, used to pick the token encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Context window of the model, used with `max_context_ratio`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_context_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_ratio: Option<f64>,
    /// Secondary message-count ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priority_blocks: Vec<PriorityBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_allocation: Option<TokenAllocation>,
    #[serde(default)]
    pub eviction_policy: EvictionPolicyKind,
    #[serde(default)]
    pub flushing_strategy: FlushingStrategyConfig,
    /// Suppresses append-triggered flushes; manual flushes still run.
    #[serde(default)]
    pub disable_flush: bool,
}

impl MemoryResource {
    /// A token-bounded resource with default flushing.
    pub fn with_max_tokens(id: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            id: id.into(),
            max_tokens: Some(max_tokens),
            ..Default::default()
        }
    }

    /// Parse a resource from its JSON representation and validate it.
    pub fn from_json(raw: &str) -> MemoryResult<Self> {
        let resource: MemoryResource = serde_json::from_str(raw)?;
        resource.validate()?;
        Ok(resource)
    }

    pub fn validate(&self) -> MemoryResult<()> {
        if self.id.trim().is_empty() {
            return Err(MemoryError::config("resource id is required"));
        }
        if self.max_tokens.is_none() && self.max_context_ratio.is_none() {
            return Err(MemoryError::config(format!(
                "resource '{}' needs either max_tokens or max_context_ratio",
                self.id
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(MemoryError::config("max_tokens must be greater than 0"));
        }
        if let Some(ratio) = self.max_context_ratio
            && !(ratio > 0.0 && ratio <= 1.0)
        {
            return Err(MemoryError::config(format!(
                "max_context_ratio must be within (0, 1], got {}",
                ratio
            )));
        }
        if self.max_messages == Some(0) {
            return Err(MemoryError::config("max_messages must be greater than 0"));
        }
        let mut seen = HashSet::new();
        for block in &self.priority_blocks {
            if !seen.insert(block.priority) {
                return Err(MemoryError::config(format!(
                    "duplicate priority block {}",
                    block.priority
                )));
            }
        }
        if let Some(allocation) = &self.token_allocation {
            allocation.validate()?;
        }
        self.flushing_strategy.validate()
    }

    /// Block configured for a priority value.
    pub fn block_for_priority(&self, priority: u32) -> Option<&PriorityBlock> {
        self.priority_blocks.iter().find(|b| b.priority == priority)
    }
}

/// Lock timings for the orchestrator's operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    pub append_ttl_ms: u64,
    pub clear_ttl_ms: u64,
    pub flush_ttl_ms: u64,
    /// Acquisition attempts before `LockTimeout`.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_base_ms: u64,
    /// Upper bound for a single backoff delay.
    pub retry_max_ms: u64,
    /// Refresh runs every `ttl / refresh_divisor`; values below 2 are raised to 2.
    pub refresh_divisor: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            append_ttl_ms: 30_000,
            clear_ttl_ms: 10_000,
            flush_ttl_ms: 300_000,
            max_retries: 20,
            retry_base_ms: 10,
            retry_max_ms: 500,
            refresh_divisor: 2,
        }
    }
}

impl LockConfig {
    pub fn append_ttl(&self) -> Duration {
        Duration::from_millis(self.append_ttl_ms)
    }

    pub fn clear_ttl(&self) -> Duration {
        Duration::from_millis(self.clear_ttl_ms)
    }

    pub fn flush_ttl(&self) -> Duration {
        Duration::from_millis(self.flush_ttl_ms)
    }

    /// Interval between TTL refreshes, strictly shorter than `ttl`.
    pub fn refresh_interval(&self, ttl: Duration) -> Duration {
        ttl / self.refresh_divisor.max(2)
    }
}

/// Expiration applied to the storage key itself. Zero disables a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Key TTL set after every append.
    pub append_secs: u64,
    /// Key TTL set after a clear.
    pub clear_secs: u64,
    /// Key TTL set after a flush.
    pub flush_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            append_secs: 30 * 60,
            clear_secs: 5 * 60,
            flush_secs: 60 * 60,
        }
    }
}

impl TtlConfig {
    /// No key expiration at all.
    pub fn disabled() -> Self {
        Self {
            append_secs: 0,
            clear_secs: 0,
            flush_secs: 0,
        }
    }

    fn non_zero(secs: u64) -> Option<Duration> {
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    pub fn after_append(&self) -> Option<Duration> {
        Self::non_zero(self.append_secs)
    }

    pub fn after_clear(&self) -> Option<Duration> {
        Self::non_zero(self.clear_secs)
    }

    pub fn after_flush(&self) -> Option<Duration> {
        Self::non_zero(self.flush_secs)
    }
}

/// Orchestrator runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub lock: LockConfig,
    pub ttl: TtlConfig,
    /// Message count below which appends skip the flush check.
    pub flush_check_min_messages: usize,
    /// Trailing messages quoted in summaries.
    pub summary_keep_last: usize,
    /// Context window assumed when a resource uses `max_context_ratio`
    /// without `model_context_size`.
    pub default_context_window: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            ttl: TtlConfig::default(),
            flush_check_min_messages: DEFAULT_FLUSH_CHECK_MIN_MESSAGES,
            summary_keep_last: DEFAULT_SUMMARY_KEEP_LAST,
            default_context_window: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_from_json() {
        let resource = MemoryResource::from_json(
            r#"{
                "id": "support_chat",
                "model": "gpt-4o",
                "max_tokens": 4000,
                "priority_blocks": [
                    {"priority": 0, "content_types": ["system"], "max_tokens": 500},
                    {"priority": 1, "content_types": ["user", "assistant"], "max_tokens": 2000}
                ],
                "token_allocation": {"short_term": 0.6, "long_term": 0.3, "system": 0.1},
                "eviction_policy": "priority",
                "flushing_strategy": {"type": "hybrid_summary", "threshold": 0.75}
            }"#,
        )
        .unwrap();

        assert_eq!(resource.max_tokens, Some(4000));
        assert_eq!(resource.eviction_policy, EvictionPolicyKind::Priority);
        assert_eq!(resource.flushing_strategy.threshold, 0.75);
        assert_eq!(
            resource.flushing_strategy.summarize_oldest_percent,
            DEFAULT_SUMMARIZE_OLDEST_PERCENT
        );
        assert_eq!(resource.block_for_priority(1).unwrap().max_tokens, Some(2000));
    }

    #[test]
    fn test_missing_budget_is_configuration_error() {
        let resource = MemoryResource {
            id: "no_budget".into(),
            ..Default::default()
        };
        assert!(matches!(
            resource.validate(),
            Err(MemoryError::Configuration { .. })
        ));
    }

    #[test]
    fn test_allocation_sum_may_be_below_one() {
        let allocation = TokenAllocation {
            short_term: 0.5,
            long_term: 0.2,
            system: 0.1,
            ..Default::default()
        };
        assert!(allocation.validate().is_ok());

        let over = TokenAllocation {
            short_term: 0.7,
            long_term: 0.3,
            system: 0.1,
            ..Default::default()
        };
        assert!(over.validate().is_err());
    }

    #[test]
    fn test_invalid_flush_settings() {
        let mut resource = MemoryResource::with_max_tokens("r", 100);
        resource.flushing_strategy.threshold = 0.0;
        assert!(resource.validate().is_err());

        resource.flushing_strategy.threshold = 0.8;
        resource.flushing_strategy.summarize_oldest_percent = 120;
        assert!(resource.validate().is_err());
    }

    #[test]
    fn test_duplicate_priority_blocks_rejected() {
        let mut resource = MemoryResource::with_max_tokens("r", 100);
        resource.priority_blocks = vec![
            PriorityBlock {
                priority: 1,
                content_types: vec!["user".into()],
                max_tokens: None,
            },
            PriorityBlock {
                priority: 1,
                content_types: vec!["tool".into()],
                max_tokens: None,
            },
        ];
        assert!(resource.validate().is_err());
    }

    #[test]
    fn test_refresh_interval_shorter_than_ttl() {
        let mut config = LockConfig::default();
        let ttl = Duration::from_secs(10);
        assert_eq!(config.refresh_interval(ttl), Duration::from_secs(5));

        config.refresh_divisor = 1;
        assert!(config.refresh_interval(ttl) < ttl);
    }

    #[test]
    fn test_ttl_zero_disables() {
        let ttl = TtlConfig::disabled();
        assert!(ttl.after_append().is_none());
        assert!(TtlConfig::default().after_flush().is_some());
    }
}
