//! Custom error types for safedump.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafedumpError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Dump tool failed: {0}")]
    Dump(String),

    #[error("Restore failed: {0}")]
    Restore(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Integrity failure: {0}")]
    Integrity(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Recovery target error: {0}")]
    RecoveryTarget(String),

    #[error("Operation timed out after {0} minutes")]
    Timeout(u64),

    #[error("Operation cancelled")]
    Cancelled,
}

impl SafedumpError {
    /// Data-integrity failures (checksum or auth-tag) are always fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SafedumpError::Integrity(_) | SafedumpError::Crypto(_))
    }
}

pub type Result<T> = std::result::Result<T, SafedumpError>;
