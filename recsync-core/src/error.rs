//! Error types for recsync operations

use thiserror::Error;

/// Remote source failures. Never retried inside the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Remote source unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Field coercion failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("Invalid value for {field}: expected {expected}, got {value}")]
    InvalidValue {
        field: String,
        expected: String,
        value: String,
    },

    #[error("Unsupported field type {type_name} for {field}")]
    UnsupportedType { field: String, type_name: String },
}

/// Server response did not line up with the submitted batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error("Response is missing created record {token}")]
    MissingCreate { token: String },

    #[error("Response is missing updated record {token}")]
    MissingUpdate { token: String },

    #[error("Response confirmed unknown business key {key}")]
    UnknownKey { key: String },
}

/// Cache and durable-state failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Backend {backend} failed: {reason}")]
    Backend { backend: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all recsync errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Reconciliation error: {0}")]
    Reconciliation(#[from] ReconciliationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// True for failures that came from the remote source.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result type alias for recsync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// TESTS
// =============================================================================
