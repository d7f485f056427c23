//! Domain error taxonomy for the state store and its sync channels

use thiserror::Error;

use crate::models::keys::StateKey;

/// Errors surfaced across the store boundary
#[derive(Debug, Error)]
pub enum StateError {
    /// A key name outside the closed key set was requested
    #[error("unknown state key '{0}'")]
    UnknownKey(String),

    /// Transient remote failure; the key stays dirty and is retried
    #[error("sync of {scope} failed: {message}")]
    SyncFailure { scope: String, message: String },

    /// Neither price provider produced a usable quote
    #[error("price unavailable for {symbol}")]
    PriceUnavailable { symbol: String },

    /// No authenticated session exists
    #[error("authentication required")]
    AuthRequired,

    /// A raced operation lost to its deadline
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// A remote row could not be decoded into the key's value shape
    #[error("failed to decode remote value for '{key}': {message}")]
    Decode { key: StateKey, message: String },
}

impl StateError {
    /// Wrap a provider error as a transient sync failure for `key`
    pub fn sync(key: StateKey, error: &anyhow::Error) -> Self {
        Self::SyncFailure {
            scope: format!("'{key}'"),
            message: format!("{error:#}"),
        }
    }

    /// Transient failure of a whole-state operation
    pub fn sync_all(error: &anyhow::Error) -> Self {
        Self::SyncFailure {
            scope: "all keys".to_string(),
            message: format!("{error:#}"),
        }
    }

    /// Whether the retry policy applies to this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SyncFailure { .. } | Self::Timeout { .. })
    }
}
