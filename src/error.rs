//! Error types for membudget operations.
//!
//! Every fallible operation returns [`MemoryResult`]. Store and lock failures
//! carry the storage key and the operation name so callers can tell which
//! memory instance and which step failed without parsing messages.
use thiserror::Error;

/// Boxed error produced by a storage or lock backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for membudget operations.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Invalid or missing budget configuration. Never retried.
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Why the configuration was rejected
        reason: String,
    },

    /// The requested token encoding could not be resolved.
    #[error("Token encoding '{encoding}' unavailable: {reason}")]
    EncodingUnavailable {
        /// The encoding or model name that was requested
        encoding: String,
        /// Backend explanation
        reason: String,
    },

    /// The lock for a storage key was not acquired within the retry budget.
    #[error("Timed out acquiring lock for '{key}' after {attempts} attempts")]
    LockTimeout {
        /// The storage key that was contended
        key: String,
        /// How many acquisition attempts were made
        attempts: u32,
    },

    /// The lock expired (or was taken over) before it was released.
    #[error("Lock for '{key}' was lost before release")]
    LockLost {
        /// The storage key whose lock was lost
        key: String,
    },

    /// A store operation failed.
    #[error("Store operation '{operation}' failed for '{key}': {source}")]
    Store {
        /// The storage key the operation targeted
        key: String,
        /// Name of the store operation (e.g. "append_message")
        operation: &'static str,
        /// Underlying backend failure
        #[source]
        source: BoxError,
    },

    /// An eviction decision tried to remove a priority-0 message.
    #[error("Eviction invariant violated at message {index}: {reason}")]
    EvictionInvariantViolation {
        /// Position of the offending message in the input list
        index: usize,
        /// Description of the violation
        reason: String,
    },

    /// The operation observed its cancellation signal.
    #[error("Operation '{operation}' was cancelled")]
    Cancelled {
        /// Name of the cancelled operation
        operation: &'static str,
    },

    /// A storage key failed validation.
    #[error("Invalid storage key '{key}': {reason}")]
    InvalidKey {
        /// The rejected key
        key: String,
        /// Why it was rejected
        reason: String,
    },

    /// Serialization error when converting data to/from JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoryError {
    /// Build a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        MemoryError::Configuration {
            reason: reason.into(),
        }
    }

    /// Wrap a backend failure with the key and operation it belongs to.
    pub fn store(
        key: impl Into<String>,
        operation: &'static str,
        source: impl Into<BoxError>,
    ) -> Self {
        MemoryError::Store {
            key: key.into(),
            operation,
            source: source.into(),
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemoryError::LockTimeout { .. }
                | MemoryError::Store { .. }
                | MemoryError::Cancelled { .. }
        )
    }
}

/// Result type alias for membudget operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_carries_context() {
        let err = MemoryError::store("agent:42", "read_messages", "connection reset");
        let text = err.to_string();
        assert!(text.contains("agent:42"));
        assert!(text.contains("read_messages"));
        assert!(text.contains("connection reset"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(
            MemoryError::LockTimeout {
                key: "k".into(),
                attempts: 3
            }
            .is_retryable()
        );
        assert!(!MemoryError::config("missing max_tokens").is_retryable());
        assert!(!MemoryError::LockLost { key: "k".into() }.is_retryable());
        assert!(
            !MemoryError::EvictionInvariantViolation {
                index: 0,
                reason: "priority 0".into()
            }
            .is_retryable()
        );
    }
}
