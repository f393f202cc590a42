//! Error types for the storage layer

use thiserror::Error;

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// Unknown reading type, on either the encode or the decode path
    #[error("Unrecognized reading type: {0}")]
    UnrecognizedType(String),

    /// A persisted item or backend response is missing expected fields
    #[error("Malformed item: {0}")]
    MalformedItem(String),

    /// Lookup of something the caller required to exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input the caller must not have constructed
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    /// Route status may only move forward
    #[error("Invalid route status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Key-value store or object store failure
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedItem(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionViolation(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
