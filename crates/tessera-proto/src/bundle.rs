//! Key directory request and response bodies
//!
//! Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::{PublicKeyBytes, SignatureBytes};

/// A one-time prekey's public half, identified by a client-chosen id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyPublic {
    /// Client-chosen identifier, unique within the device
    pub key_id: String,
    /// X25519 public key
    pub public_key: PublicKeyBytes,
}

/// Medium-term prekey and its signature under the identity signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyPublic {
    /// X25519 public key
    pub public_key: PublicKeyBytes,
    /// Ed25519 signature over `public_key`
    pub signature: SignatureBytes,
}

/// `POST /devices` body.
///
/// Required fields are optional here so that a missing field is reported as
/// an invalid argument instead of a generic decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishDeviceRequest {
    /// Device id; the service assigns one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// X25519 identity public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<PublicKeyBytes>,
    /// Ed25519 key that signed `signed_pre_key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_signing_key: Option<PublicKeyBytes>,
    /// Signed prekey
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_pre_key: Option<SignedPreKeyPublic>,
    /// Initial one-time prekeys
    #[serde(default)]
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
    /// Bundle version to start at (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_version: Option<u64>,
}

/// `POST /prekeys` body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopUpRequest {
    /// Device to add keys to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Keys to add
    #[serde(default)]
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

/// Result of publishing a device or topping up its prekeys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReceipt {
    /// Device id (assigned or echoed)
    pub device_id: String,
    /// Bundle version after the operation
    pub bundle_version: u64,
    /// Unused one-time prekeys held for the device
    pub one_time_pre_key_count: usize,
}

/// A granted prekey bundle. The one-time prekey is consumed by the grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    /// Owner of the device
    pub user_id: String,
    /// Device the bundle belongs to
    pub device_id: String,
    /// Bundle version after the grant
    pub bundle_version: u64,
    /// X25519 identity public key
    pub identity_key: PublicKeyBytes,
    /// Ed25519 key that signed the signed prekey, when published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_signing_key: Option<PublicKeyBytes>,
    /// Signed prekey
    pub signed_pre_key: SignedPreKeyPublic,
    /// The one-time prekey granted to this caller
    pub one_time_pre_key: OneTimePreKeyPublic,
}

/// Lifecycle state of a published device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Bundle can be granted
    Active,
    /// Bundle is retired and never granted
    Revoked,
}

/// Result of revoking a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeReceipt {
    /// Revoked device
    pub device_id: String,
    /// Always `revoked`
    pub status: DeviceStatus,
    /// Bundle version after revocation
    pub bundle_version: u64,
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable reason
    pub message: String,
}
