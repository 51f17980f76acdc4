//! Error types for BucketSync
//!
//! Every failure is classified into one of a small set of kinds so that the
//! retry executor and the sync session can decide what to do with it without
//! inspecting messages.

use std::path::PathBuf;
use thiserror::Error;

/// Classification of a failure, used for retry and reporting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or server-side failure; worth retrying
    Transient,
    /// The remote store refused the request; retrying will not help
    Rejected,
    /// Checksum or declared size did not match the bytes transferred
    IntegrityMismatch,
    /// A limit was violated before any request was issued
    PreconditionViolation,
    /// Cooperative cancellation
    Cancelled,
    /// Local filesystem failure
    Local,
    /// Invalid configuration
    Config,
}

/// Main error type for BucketSync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error during local file operations
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Retryable failure talking to the object store
    #[error("Request '{operation}' failed for '{key}': {message}")]
    Transient {
        operation: &'static str,
        key: String,
        message: String,
    },

    /// Non-retryable refusal from the object store
    #[error("Request '{operation}' rejected for '{key}' (status {status:?}): {message}")]
    Rejected {
        operation: &'static str,
        key: String,
        status: Option<u16>,
        message: String,
    },

    /// Content verification failed
    #[error("Integrity check failed for '{key}': expected {expected}, got {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    /// Object or part layout violates a store limit
    #[error("Precondition failed for '{key}': {message}")]
    Precondition { key: String, message: String },

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A spawned task panicked or was aborted
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a retryable remote error
    pub fn transient(
        operation: &'static str,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transient {
            operation,
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a non-retryable remote error
    pub fn rejected(
        operation: &'static str,
        key: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::Rejected {
            operation,
            key: key.into(),
            status,
            message: message.into(),
        }
    }

    /// Create an integrity mismatch error
    pub fn integrity_mismatch(
        key: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::IntegrityMismatch {
            key: key.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a precondition violation
    pub fn precondition(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Precondition {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Local,
            Self::Transient { .. } | Self::TaskFailed(_) => ErrorKind::Transient,
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            Self::Precondition { .. } => ErrorKind::PreconditionViolation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ConfigError(_) => ErrorKind::Config,
            Self::WithContext { source, .. } => source.kind(),
        }
    }

    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::WithContext { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Get the remote key associated with this error, if any
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Transient { key, .. }
            | Self::Rejected { key, .. }
            | Self::IntegrityMismatch { key, .. }
            | Self::Precondition { key, .. } => Some(key),
            Self::WithContext { source, .. } => source.key(),
            _ => None,
        }
    }

    /// Get the local path associated with this error, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Io { path, .. } => Some(path),
            Self::WithContext { source, .. } => source.path(),
            _ => None,
        }
    }
}

/// Result type alias for BucketSync operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::ConfigError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::TaskFailed(err.to_string())
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| SyncError::io(path, e))
    }
}
