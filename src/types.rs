//! Common types used throughout membudget.
//!
//! These are the values that cross the store boundary (messages) and the
//! values handed back to callers (flush results, health snapshots). Messages
//! are immutable once appended; the only way the stored list changes shape
//! is through a flush or a clear.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Prefix marking synthesized summary content.
pub const SUMMARY_TAG: &str = "[summary]";

/// The author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions and synthesized summaries.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool call results.
    Tool,
}

impl Role {
    /// Lowercase name as used on the wire and in `content_types` lists.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional per-message metadata.
///
/// Unknown keys are preserved in `extra` so a list written by another
/// producer survives a flush round trip unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Eviction priority; 0 is never evicted, larger numbers go first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,

    /// When set the message is accepted but never written to the store.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub non_persistable: bool,

    /// Free-form content type, matched against priority blocks and
    /// user-defined allocation classes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Marks a message synthesized by a flush.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,

    /// Any other keys.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// One conversation turn.
///
/// Wire shape: `{role, content, metadata?}`. Non-text payloads (tool call
/// arguments, structured results) are carried as opaque text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    /// Create a message with no metadata.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    /// Build a synthesized summary message.
    ///
    /// The body is prefixed with [`SUMMARY_TAG`] and the metadata records how
    /// many messages were folded into it.
    pub fn summary(body: &str, summarized_count: usize) -> Self {
        let mut extra = Map::new();
        extra.insert("summarized_count".to_string(), JsonValue::from(summarized_count));
        Self {
            role: Role::System,
            content: format!("{} {}", SUMMARY_TAG, body),
            metadata: Some(MessageMetadata {
                summary: true,
                extra,
                ..Default::default()
            }),
        }
    }

    /// Set an explicit eviction priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.metadata_mut().priority = Some(priority);
        self
    }

    /// Set the content type used for block and class matching.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.metadata_mut().content_type = Some(content_type.into());
        self
    }

    /// Mark the message as never persisted.
    pub fn non_persistable(mut self) -> Self {
        self.metadata_mut().non_persistable = true;
        self
    }

    /// Replace the metadata wholesale.
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Explicit priority from metadata, if any.
    pub fn priority(&self) -> Option<u32> {
        self.metadata.as_ref().and_then(|m| m.priority)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.content_type.as_deref())
    }

    pub fn is_non_persistable(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.non_persistable)
    }

    /// Whether this message was synthesized by a flush.
    pub fn is_summary(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.summary)
    }

    fn metadata_mut(&mut self) -> &mut MessageMetadata {
        self.metadata.get_or_insert_with(MessageMetadata::default)
    }
}

/// Outcome of a flush.
///
/// `messages` is the full retained list in chronological order: the summary
/// (if one was generated) sits where the summarized segment used to be,
/// followed by the retained tail.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushResult {
    /// Retained messages, summary included.
    pub messages: Vec<Message>,
    /// Number of original messages folded into the summary.
    pub summarized_count: usize,
    /// Number of messages removed by the eviction pass.
    pub evicted_count: usize,
    /// Whether a summary message was synthesized.
    pub summary_generated: bool,
    /// Token total before the flush.
    pub tokens_before: usize,
    /// Token total of `messages`.
    pub token_count: usize,
    /// Estimated tokens reclaimed (`tokens_before - token_count`, floored at 0).
    pub tokens_reclaimed: usize,
}

impl FlushResult {
    /// Whether the stored list has to be replaced.
    pub fn is_modified(&self) -> bool {
        self.summary_generated || self.evicted_count > 0
    }
}

/// Diagnostic snapshot of a memory instance.
///
/// Gathered without the lock; a concurrent append may or may not be
/// reflected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHealth {
    pub token_count: usize,
    pub message_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_flush: Option<DateTime<Utc>>,
    pub flush_strategy: String,
}
