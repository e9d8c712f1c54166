//! Error types for teamboard-core
//!
//! Upstream failures are always surfaced to the originating caller.
//! Cache-internal problems never become a `SyncError`; they are logged and
//! healed by the next access.

use teamboard_types::EntityKey;
use thiserror::Error;

/// Convenience alias used throughout the crate
pub type SyncResult<T> = Result<T, SyncError>;

/// Core error type for sync-layer operations
#[derive(Error, Debug)]
pub enum SyncError {
    // ===================
    // Upstream Errors
    // ===================
    #[error("Entity not found: {key}")]
    NotFound { key: EntityKey },

    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    FetchTimeout { operation: String, timeout_ms: u64 },

    #[error("Write conflict on {key} (current version: {current_version:?})")]
    WriteConflict {
        key: EntityKey,
        current_version: Option<u64>,
    },

    #[error("Change feed disconnected for {scope}: {reason}")]
    FeedDisconnected { scope: String, reason: String },

    #[error("Store error: {message}")]
    Store { message: String },

    // ===================
    // Serialization Errors
    // ===================
    #[error("Failed to decode {key}")]
    Decode {
        key: EntityKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {key}")]
    Encode {
        key: EntityKey,
        #[source]
        source: serde_json::Error,
    },

    // ===================
    // Config Errors
    // ===================
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // ===================
    // Lifecycle Errors
    // ===================
    #[error("Sync layer not started")]
    NotStarted,

    #[error("Sync layer has been shut down")]
    ShutDown,
}

impl SyncError {
    pub fn store(message: impl Into<String>) -> Self {
        SyncError::Store {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        SyncError::InvalidConfig {
            message: message.into(),
        }
    }

    /// Errors originating from the persistent store or its feed
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            SyncError::NotFound { .. }
                | SyncError::FetchTimeout { .. }
                | SyncError::WriteConflict { .. }
                | SyncError::FeedDisconnected { .. }
                | SyncError::Store { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::WriteConflict { .. })
    }
}
