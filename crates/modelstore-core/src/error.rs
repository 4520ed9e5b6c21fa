//! Error types for the model store.
//!
//! Every fallible operation in the crate returns [`StoreError`]. Filesystem
//! failures carry the path and the operation that failed so callers can report
//! them without extra context.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the model store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A tag, ID or blob does not exist.
    #[error("Not found: {reference}")]
    NotFound { reference: String },

    /// Store contents are ambiguous (e.g. two projector files in one bundle).
    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Invalid reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Invalid digest {digest:?}: {reason}")]
    InvalidDigest { digest: String, reason: String },

    /// Content does not match what was promised: a manifest referencing a
    /// missing blob, or streamed bytes whose hash differs from the digest.
    #[error("Integrity error: {message}")]
    Integrity { message: String },

    #[error("Store layout version {found} is not supported (expected {expected})")]
    IncompatibleLayout { found: String, expected: String },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl StoreError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        StoreError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create an IO error describing the operation that failed on `path`.
    pub fn io_op(operation: &str, err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        StoreError::Io {
            message: format!("{} {}: {}", operation, path.display(), err),
            path: Some(path),
            source: Some(err),
        }
    }

    pub fn not_found(reference: impl Into<String>) -> Self {
        StoreError::NotFound {
            reference: reference.into(),
        }
    }

    /// Whether the underlying cause is a missing file or missing model.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound { .. } => true,
            StoreError::Io {
                source: Some(e), ..
            } => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Map to a stable, short category name used in CLI output and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::Conflict { .. } => "conflict",
            StoreError::InvalidReference { .. } | StoreError::InvalidDigest { .. } => {
                "invalid_reference"
            }
            StoreError::Integrity { .. } => "integrity",
            StoreError::IncompatibleLayout { .. } => "incompatible_layout",
            StoreError::Io { .. } => "io",
            StoreError::Json { .. } => "json",
            StoreError::Other(_) => "other",
        }
    }
}
