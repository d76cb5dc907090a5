//! Token counting.
//!
//! A [`TokenCounter`] turns text into a token count for a named encoding.
//! Counting is pure: the same `(text, encoding)` pair always yields the same
//! count. [`TokenCountService`] sits in front of a backend, resolves the
//! requested encoding once (falling back to the backend default with a
//! warning) and memoises per-message counts so unchanged messages are not
//! re-tokenized on every flush check.
pub mod budget;

use crate::error::{MemoryError, MemoryResult};
use crate::types::Message;
use dashmap::DashMap;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

pub use budget::{TokenBudgetAllocator, classify};

/// Encoding used when nothing else resolves.
pub const DEFAULT_ENCODING: &str = "cl100k_base";

/// Characters per token assumed by [`CharRatioCounter`].
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

/// Memo entries kept before the memo is reset.
pub const DEFAULT_MEMO_CAPACITY: usize = 10_000;

/// Backend converting text to a token count.
pub trait TokenCounter: Send + Sync {
    /// Count tokens of `text` under `encoding`.
    ///
    /// Fails with [`MemoryError::EncodingUnavailable`] when the encoding
    /// cannot be resolved. Never returns 0 for non-empty text as a way of
    /// signalling failure.
    fn count_tokens(&self, text: &str, encoding: &str) -> MemoryResult<usize>;

    /// Encoding that always resolves for this backend.
    fn default_encoding(&self) -> &str;

    /// Whether `encoding` resolves without counting anything.
    fn supports(&self, encoding: &str) -> bool {
        self.count_tokens("", encoding).is_ok()
    }
}

/// BPE counter backed by `tiktoken-rs`.
///
/// Accepts encoding names (`cl100k_base`, `o200k_base`, `p50k_base`,
/// `p50k_edit`, `r50k_base`) and model names (`gpt-4o`, `gpt-3.5-turbo`).
/// Loaded encoders are cached for the life of the counter.
#[derive(Default)]
pub struct TiktokenCounter {
    encoders: DashMap<String, Arc<CoreBPE>>,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn encoder(&self, encoding: &str) -> MemoryResult<Arc<CoreBPE>> {
        if let Some(bpe) = self.encoders.get(encoding) {
            return Ok(Arc::clone(bpe.value()));
        }

        let loaded = match encoding {
            "cl100k_base" => tiktoken_rs::cl100k_base(),
            "o200k_base" => tiktoken_rs::o200k_base(),
            "p50k_base" => tiktoken_rs::p50k_base(),
            "p50k_edit" => tiktoken_rs::p50k_edit(),
            "r50k_base" | "gpt2" => tiktoken_rs::r50k_base(),
            model => tiktoken_rs::get_bpe_from_model(model),
        }
        .map_err(|e| MemoryError::EncodingUnavailable {
            encoding: encoding.to_string(),
            reason: e.to_string(),
        })?;

        let bpe = Arc::new(loaded);
        self.encoders
            .insert(encoding.to_string(), Arc::clone(&bpe));
        debug!(encoding, "Loaded token encoder");
        Ok(bpe)
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_tokens(&self, text: &str, encoding: &str) -> MemoryResult<usize> {
        let bpe = self.encoder(encoding)?;
        Ok(bpe.encode_with_special_tokens(text).len())
    }

    fn default_encoding(&self) -> &str {
        DEFAULT_ENCODING
    }

    fn supports(&self, encoding: &str) -> bool {
        self.encoder(encoding).is_ok()
    }
}

/// Deterministic estimator: `ceil(chars / chars_per_token)`.
///
/// Accepts any encoding name. Used as the fallback backend and in tests,
/// where exact counts make budgets easy to reason about.
#[derive(Debug, Clone)]
pub struct CharRatioCounter {
    chars_per_token: usize,
}

impl CharRatioCounter {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioCounter {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenCounter for CharRatioCounter {
    fn count_tokens(&self, text: &str, _encoding: &str) -> MemoryResult<usize> {
        Ok(text.chars().count().div_ceil(self.chars_per_token))
    }

    fn default_encoding(&self) -> &str {
        "char_ratio"
    }

    fn supports(&self, _encoding: &str) -> bool {
        true
    }
}

/// Token counting bound to one resolved encoding, with a per-message memo.
pub struct TokenCountService {
    backend: Arc<dyn TokenCounter>,
    encoding: String,
    memo: DashMap<[u8; 32], usize>,
    memo_capacity: usize,
}

impl TokenCountService {
    /// Bind `backend` to `requested`, falling back to the backend default.
    ///
    /// Fallback is logged, never silent. Fails only if the default encoding
    /// itself cannot be resolved.
    pub fn new(backend: Arc<dyn TokenCounter>, requested: Option<&str>) -> MemoryResult<Self> {
        let default = backend.default_encoding().to_string();
        let encoding = match requested {
            Some(name) if backend.supports(name) => name.to_string(),
            Some(name) => {
                warn!(
                    requested = name,
                    fallback = %default,
                    "Token encoding unavailable, falling back to default"
                );
                default
            }
            None => default,
        };

        if !backend.supports(&encoding) {
            return Err(MemoryError::EncodingUnavailable {
                encoding,
                reason: "default encoding failed to load".to_string(),
            });
        }

        Ok(Self {
            backend,
            encoding,
            memo: DashMap::new(),
            memo_capacity: DEFAULT_MEMO_CAPACITY,
        })
    }

    /// Override the memo size; 0 disables memoisation.
    pub fn with_memo_capacity(mut self, capacity: usize) -> Self {
        self.memo_capacity = capacity;
        self
    }

    /// The encoding counts are computed with.
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn count_text(&self, text: &str) -> MemoryResult<usize> {
        self.backend.count_tokens(text, &self.encoding)
    }

    /// Tokens of one message's content, memoised by content hash.
    pub fn count_message(&self, message: &Message) -> MemoryResult<usize> {
        if self.memo_capacity == 0 {
            return self.count_text(&message.content);
        }

        let mut hasher = blake3::Hasher::new();
        hasher.update(self.encoding.as_bytes());
        hasher.update(&[0]);
        hasher.update(message.content.as_bytes());
        let digest: [u8; 32] = *hasher.finalize().as_bytes();

        if let Some(count) = self.memo.get(&digest) {
            return Ok(*count);
        }

        let count = self.count_text(&message.content)?;
        if self.memo.len() >= self.memo_capacity {
            self.memo.clear();
        }
        self.memo.insert(digest, count);
        Ok(count)
    }

    /// Per-message counts, index-aligned with `messages`.
    pub fn count_messages(&self, messages: &[Message]) -> MemoryResult<Vec<usize>> {
        messages.iter().map(|m| self.count_message(m)).collect()
    }

    pub fn total(&self, messages: &[Message]) -> MemoryResult<usize> {
        Ok(self.count_messages(messages)?.iter().sum())
    }

    /// Number of memoised entries.
    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }
}

impl std::fmt::Debug for TokenCountService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCountService")
            .field("encoding", &self.encoding)
            .field("memo_len", &self.memo.len())
            .finish()
    }
}
