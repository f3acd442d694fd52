//! Error type system for the replica engine
//!
//! This module provides:
//! - A typed `StorageError` for every local persistence failure
//! - The crate-wide `ReplicaError` taxonomy (storage, transient network,
//!   offline rejection, permanent task failure, ...)
//! - Retry classification used by the task queue and the sync orchestrator
//! - An `ErrorContext` extension trait for attaching operation context

use std::fmt;

/// Local persistence failure
///
/// Always fatal to the calling sync step; never retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Storage worker panicked: {0}")]
    Worker(String),

    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },

    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Main error type for the replica and synchronization engine
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Operation not supported offline: {0}")]
    UnsupportedOffline(&'static str),

    #[error("Task permanently failed: {0}")]
    TaskPermanentFailure(String),

    /// Non-success response the server will not change its mind about
    #[error("Rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for ReplicaError {
    fn from(err: rusqlite::Error) -> Self {
        ReplicaError::Storage(StorageError::Sqlite(err))
    }
}

impl From<serde_json::Error> for ReplicaError {
    fn from(err: serde_json::Error) -> Self {
        ReplicaError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for ReplicaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return ReplicaError::TransientNetwork(err.to_string());
        }
        if err.is_decode() {
            return ReplicaError::Serialization(err.to_string());
        }
        match err.status() {
            Some(status) if is_transient_status(status.as_u16()) => {
                ReplicaError::TransientNetwork(err.to_string())
            }
            Some(status) => ReplicaError::Rejected {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => ReplicaError::TransientNetwork(err.to_string()),
        }
    }
}

/// Statuses that describe the server's (or the path's) state, not the request's
pub fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

impl ReplicaError {
    /// Get the error type name for diagnostics and the log journal
    pub fn error_type(&self) -> &'static str {
        match self {
            ReplicaError::Storage(_) => "StorageError",
            ReplicaError::TransientNetwork(_) => "TransientNetworkError",
            ReplicaError::UnsupportedOffline(_) => "UnsupportedOffline",
            ReplicaError::TaskPermanentFailure(_) => "TaskPermanentFailure",
            ReplicaError::Rejected { .. } => "Rejected",
            ReplicaError::NotFound(_) => "NotFound",
            ReplicaError::Validation(_) => "ValidationError",
            ReplicaError::Serialization(_) => "SerializationError",
            ReplicaError::Config(_) => "ConfigError",
            ReplicaError::Io(_) => "IoError",
            ReplicaError::Cancelled => "Cancelled",
        }
    }

    /// Check if this error is retryable
    ///
    /// Only connectivity problems are. Storage errors are fatal to the step,
    /// and a rejection will be rejected again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReplicaError::TransientNetwork(_))
    }

    /// Data-shape problems abort a sync pass instead of suspending it
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            ReplicaError::Storage(_)
                | ReplicaError::Serialization(_)
                | ReplicaError::Validation(_)
        )
    }

    /// Shorthand for a storage-layer corruption report
    pub fn corrupt(table: &'static str, reason: impl fmt::Display) -> Self {
        ReplicaError::Storage(StorageError::Corrupt {
            table,
            reason: reason.to_string(),
        })
    }
}

/// Result type alias for operations that can fail with ReplicaError
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Context extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ReplicaError::Validation(format!("{}: {}", context.into(), e)))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ReplicaError::Validation(format!("{}: {}", f(), e)))
    }
}
