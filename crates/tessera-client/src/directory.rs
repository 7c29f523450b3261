//! Key directory seam.
//!
//! The session manager reaches the key directory through
//! [`BundleDirectory`] so that the transport (HTTP client, in-process
//! service, test double) is chosen by the embedding application. A
//! directory handle acts on behalf of one authenticated user.

use async_trait::async_trait;
use tessera_proto::{DeviceReceipt, PreKeyBundle, PublishDeviceRequest, TopUpRequest};
use thiserror::Error;

/// Errors reported by a key directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// Request rejected as invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Device is already registered and active.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No such device, or no bundle with an unused prekey.
    #[error("not found: {0}")]
    NotFound(String),

    /// Directory could not be reached or failed internally.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl DirectoryError {
    /// Whether the request may succeed if retried after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Unavailable(_))
    }
}

/// Remote key directory, acting as one authenticated user.
///
/// Every method is safe to retry: a repeated fetch grants another prekey,
/// a repeated registration yields [`DirectoryError::Conflict`].
#[async_trait]
pub trait BundleDirectory: Send + Sync {
    /// Publish this device's identity and prekeys.
    async fn register_device(
        &self,
        request: PublishDeviceRequest,
    ) -> Result<DeviceReceipt, DirectoryError>;

    /// Obtain a bundle for `user_id`, consuming one of its one-time prekeys.
    async fn fetch_bundle(&self, user_id: &str) -> Result<PreKeyBundle, DirectoryError>;

    /// Add one-time prekeys to this user's device.
    async fn top_up(&self, request: TopUpRequest) -> Result<DeviceReceipt, DirectoryError>;
}
