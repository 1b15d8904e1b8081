//! Error types for the synchronization core.
//!
//! Contract violations (`Reentrancy`, `UnknownStrategy`) are returned
//! immediately. Infrastructure failures (`Fetch`, `Connection`) are
//! absorbed by the managers and turned into observable state; they only
//! reach callers where an operation has nothing else to return.

use thiserror::Error;

/// Errors produced by the synchronization core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// `set_state` or `dispatch` was called from inside an in-progress update.
    #[error("reentrant update: set_state/dispatch called while an update is in progress")]
    Reentrancy,

    /// A conflict resolution strategy name that is not recognised.
    #[error("unknown conflict strategy: {0}")]
    UnknownStrategy(String),

    /// A query's fetch function failed after all retries.
    #[error("fetch failed for {key}: {message}")]
    Fetch { key: String, message: String },

    /// Cannot connect to or communicate with the realtime endpoint.
    #[error("connection error: {0}")]
    Connection(String),

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid storage or query key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Database error from SQLx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error type returned by subscriber and handler callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of subscriber and handler callbacks.
pub type CallbackResult = std::result::Result<(), CallbackError>;

impl SyncError {
    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Fetch { .. } | SyncError::Connection(_) | SyncError::Database(_)
        )
    }

    /// Returns true if this error signals a programming error by the caller.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, SyncError::Reentrancy | SyncError::UnknownStrategy(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::Fetch {
            key: "[\"threats\"]".to_string(),
            message: "timeout".to_string(),
        };
        assert!(err.to_string().contains("fetch failed"));
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_unknown_strategy_display() {
        let err = SyncError::UnknownStrategy("coin-flip".to_string());
        assert_eq!(err.to_string(), "unknown conflict strategy: coin-flip");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Connection("reset".to_string()).is_retryable());
        assert!(SyncError::Fetch {
            key: "k".to_string(),
            message: "m".to_string()
        }
        .is_retryable());
        assert!(!SyncError::Reentrancy.is_retryable());
        assert!(!SyncError::InvalidKey("x".to_string()).is_retryable());
    }

    #[test]
    fn test_contract_violations() {
        assert!(SyncError::Reentrancy.is_contract_violation());
        assert!(SyncError::UnknownStrategy("x".to_string()).is_contract_violation());
        assert!(!SyncError::Connection("x".to_string()).is_contract_violation());
    }

    #[test]
    fn test_from_serde_json() {
        let err: SyncError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, SyncError::Serialization(_)));
    }
}
