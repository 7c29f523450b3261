//! Key directory errors.

use thiserror::Error;

use crate::storage::StorageError;

/// Errors from key directory operations.
///
/// Every variant maps onto one HTTP status in the API layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BundleError {
    /// Request is malformed or violates a limit (400).
    #[error("{0}")]
    InvalidArgument(String),

    /// An active device with this id is already registered (409).
    #[error("device {device_id} already registered")]
    Conflict {
        /// Device that already exists
        device_id: String,
    },

    /// No matching active device, or no grantable bundle (404).
    #[error("{0}")]
    NotFound(String),

    /// Store failure (500).
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl BundleError {
    /// Whether the caller may retry the same request later.
    ///
    /// `NotFound` from a grant clears once the peer tops up or registers.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Storage(err) => err.is_transient(),
            Self::InvalidArgument(_) | Self::Conflict { .. } => false,
        }
    }
}
