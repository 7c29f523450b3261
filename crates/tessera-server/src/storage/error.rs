//! Storage error types.
//!
//! - `Serialization`: a stored bundle failed to encode or decode
//! - `Io`: underlying database errors
//! - `Poisoned`: a writer panicked while holding the in-memory lock

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),

    /// In-memory store lock was poisoned
    #[error("store lock poisoned")]
    Poisoned,
}

impl StorageError {
    /// Whether retrying the same operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
