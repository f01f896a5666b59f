//! Error types for the stream store.

use crate::types::{ExpectedVersion, StreamVersion};
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Wrong expected version appending to {stream}: expected {expected}, actual {actual:?}")]
    ConcurrencyConflict {
        stream: String,
        expected: ExpectedVersion,
        /// Current version of the stream (None = stream does not exist).
        actual: Option<StreamVersion>,
    },

    #[error("Notifier initialization failed: {0}")]
    NotifierInitialization(String),

    #[error("Store '{0}' has been disposed")]
    Disposed(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Subscription '{name}' faulted: {reason}")]
    SubscriptionFaulted { name: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::BackendUnavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::BackendUnavailable(e.to_string())
            }
            Some(ErrorCode::CannotOpen) => StoreError::BackendUnavailable(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
