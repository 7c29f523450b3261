//! Key directory: device registration and prekey grants.
//!
//! Holds one bundle per `(user, device)`. A grant removes exactly one unused
//! one-time prekey inside the same store update, so concurrent grants for
//! the same user never return the same key. The bundle keeps only the ids of
//! recently granted keys, which is what duplicate-id checks need.
//!
//! # Invariants
//!
//! - A granted one-time prekey is never granted again.
//! - Unused one-time prekeys per device never exceed
//!   [`DirectoryConfig::max_one_time_pre_keys`].
//! - Revoked bundles are never granted or topped up.
//! - Every mutation increments `bundle_version`.

use std::collections::{HashSet, VecDeque};

use tessera_proto::{
    DeviceReceipt, DeviceStatus, OneTimePreKeyPublic, PreKeyBundle, PublishDeviceRequest,
    RevokeReceipt,
};

use crate::{
    BundleError,
    storage::{BundleStore, DeviceBundle, StoredPreKey},
};

/// Default cap on unused one-time prekeys per device.
pub const DEFAULT_MAX_ONE_TIME_PRE_KEYS: usize = 200;

/// Longest accepted user, device or key id.
const MAX_ID_LEN: usize = 256;

/// Directory limits.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Cap on unused one-time prekeys held per device
    pub max_one_time_pre_keys: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self { max_one_time_pre_keys: DEFAULT_MAX_ONE_TIME_PRE_KEYS }
    }
}

/// Device registration and prekey grant logic over a [`BundleStore`].
#[derive(Clone)]
pub struct KeyDirectory<S: BundleStore> {
    store: S,
    config: DirectoryConfig,
}

impl<S: BundleStore> KeyDirectory<S> {
    /// Create a directory over `store`.
    pub fn new(store: S, config: DirectoryConfig) -> Self {
        Self { store, config }
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register a device for `user_id`.
    ///
    /// A missing device id is assigned. Publishing over an active device is
    /// a conflict; publishing over a revoked one reactivates it with a
    /// version above the revoked record's.
    pub fn publish(
        &self,
        user_id: &str,
        request: PublishDeviceRequest,
    ) -> Result<DeviceReceipt, BundleError> {
        validate_id(user_id, "userId")?;

        let PublishDeviceRequest {
            device_id,
            identity_key,
            identity_signing_key,
            signed_pre_key,
            one_time_pre_keys,
            bundle_version,
        } = request;

        let (Some(identity_key), Some(signed_pre_key)) = (identity_key, signed_pre_key) else {
            return Err(BundleError::InvalidArgument(
                "identityKey and signedPreKey are required".into(),
            ));
        };

        let device_id = device_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        validate_id(&device_id, "deviceId")?;
        self.validate_pre_keys(&one_time_pre_keys)?;

        let requested_version = bundle_version.unwrap_or(1);

        let receipt = self.store.update_device(user_id, &device_id, |slot| {
            let (bundle_version, used_pre_key_ids) = match slot.as_ref() {
                Some(existing) if existing.is_active() => {
                    return Err(BundleError::Conflict { device_id: device_id.clone() });
                },
                Some(revoked) => (
                    requested_version.max(revoked.bundle_version + 1),
                    revoked.used_pre_key_ids.clone(),
                ),
                None => (requested_version, VecDeque::new()),
            };

            if one_time_pre_keys
                .iter()
                .any(|key| used_pre_key_ids.iter().any(|id| id == &key.key_id))
            {
                return Err(BundleError::InvalidArgument("duplicate keyId".into()));
            }

            let one_time_pre_keys: VecDeque<StoredPreKey> = one_time_pre_keys
                .into_iter()
                .map(|key| StoredPreKey { key_id: key.key_id, public_key: key.public_key })
                .collect();

            let receipt = DeviceReceipt {
                device_id: device_id.clone(),
                bundle_version,
                one_time_pre_key_count: one_time_pre_keys.len(),
            };

            *slot = Some(DeviceBundle {
                user_id: user_id.to_owned(),
                device_id: device_id.clone(),
                status: DeviceStatus::Active,
                bundle_version,
                identity_key,
                identity_signing_key,
                signed_pre_key,
                one_time_pre_keys,
                used_pre_key_ids,
                update_seq: 0,
            });

            Ok(receipt)
        })?;

        tracing::info!(
            user_id,
            device_id = %receipt.device_id,
            bundle_version = receipt.bundle_version,
            one_time_pre_keys = receipt.one_time_pre_key_count,
            "device registered"
        );

        Ok(receipt)
    }

    /// Grant one prekey bundle of `user_id`, consuming a one-time prekey.
    ///
    /// Picks the most recently updated active device with an unused key and
    /// grants that device's oldest unused key.
    pub fn consume_one(&self, user_id: &str) -> Result<PreKeyBundle, BundleError> {
        validate_id(user_id, "userId")?;

        let granted = self.store.update_freshest(user_id, DeviceBundle::can_grant, |bundle| {
            let Some(pre_key) = bundle.take_oldest_pre_key() else {
                return Err(BundleError::NotFound(format!("no prekeys available for {user_id}")));
            };
            let one_time_pre_key =
                OneTimePreKeyPublic { key_id: pre_key.key_id, public_key: pre_key.public_key };

            bundle.bundle_version += 1;

            let remaining = bundle.unused_pre_key_count();
            Ok((
                PreKeyBundle {
                    user_id: bundle.user_id.clone(),
                    device_id: bundle.device_id.clone(),
                    bundle_version: bundle.bundle_version,
                    identity_key: bundle.identity_key,
                    identity_signing_key: bundle.identity_signing_key,
                    signed_pre_key: bundle.signed_pre_key.clone(),
                    one_time_pre_key,
                },
                remaining,
            ))
        })?;

        let Some((grant, remaining)) = granted else {
            tracing::debug!(user_id, "no grantable bundle");
            return Err(BundleError::NotFound(format!("no prekeys available for {user_id}")));
        };

        tracing::debug!(
            user_id,
            device_id = %grant.device_id,
            key_id = %grant.one_time_pre_key.key_id,
            remaining,
            "prekey granted"
        );
        if remaining == 0 {
            tracing::warn!(
                user_id,
                device_id = %grant.device_id,
                "device has no unused prekeys left"
            );
        }

        Ok(grant)
    }

    /// Add one-time prekeys to an active device of `user_id`.
    pub fn top_up(
        &self,
        user_id: &str,
        device_id: &str,
        pre_keys: Vec<OneTimePreKeyPublic>,
    ) -> Result<DeviceReceipt, BundleError> {
        validate_id(user_id, "userId")?;
        validate_id(device_id, "deviceId")?;
        if pre_keys.is_empty() {
            return Err(BundleError::InvalidArgument("oneTimePreKeys must not be empty".into()));
        }
        self.validate_pre_keys(&pre_keys)?;

        let max = self.config.max_one_time_pre_keys;
        let receipt = self.store.update_device(user_id, device_id, |slot| {
            let Some(bundle) = slot.as_mut().filter(|bundle| bundle.is_active()) else {
                return Err(BundleError::NotFound(format!("no active device {device_id}")));
            };

            if pre_keys.iter().any(|new| bundle.knows_key_id(&new.key_id)) {
                return Err(BundleError::InvalidArgument("duplicate keyId".into()));
            }

            let unused = bundle.unused_pre_key_count();
            if unused + pre_keys.len() > max {
                return Err(BundleError::InvalidArgument(format!(
                    "too many one-time prekeys: {unused} unused + {} new exceeds {max}",
                    pre_keys.len()
                )));
            }

            bundle.one_time_pre_keys.extend(
                pre_keys
                    .into_iter()
                    .map(|key| StoredPreKey { key_id: key.key_id, public_key: key.public_key }),
            );
            bundle.bundle_version += 1;

            Ok(DeviceReceipt {
                device_id: bundle.device_id.clone(),
                bundle_version: bundle.bundle_version,
                one_time_pre_key_count: bundle.unused_pre_key_count(),
            })
        })?;

        tracing::info!(
            user_id,
            device_id,
            bundle_version = receipt.bundle_version,
            unused = receipt.one_time_pre_key_count,
            "prekeys topped up"
        );

        Ok(receipt)
    }

    /// Revoke an active device of `user_id`.
    pub fn revoke(&self, user_id: &str, device_id: &str) -> Result<RevokeReceipt, BundleError> {
        validate_id(user_id, "userId")?;
        validate_id(device_id, "deviceId")?;

        let receipt = self.store.update_device(user_id, device_id, |slot| {
            let Some(bundle) = slot.as_mut().filter(|bundle| bundle.is_active()) else {
                return Err(BundleError::NotFound(format!("no active device {device_id}")));
            };

            bundle.status = DeviceStatus::Revoked;
            bundle.bundle_version += 1;

            Ok(RevokeReceipt {
                device_id: bundle.device_id.clone(),
                status: DeviceStatus::Revoked,
                bundle_version: bundle.bundle_version,
            })
        })?;

        tracing::info!(
            user_id,
            device_id,
            bundle_version = receipt.bundle_version,
            "device revoked"
        );

        Ok(receipt)
    }

    /// Current record of a device, active or revoked.
    pub fn device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceBundle>, BundleError> {
        Ok(self.store.load_device(user_id, device_id)?)
    }

    fn validate_pre_keys(&self, pre_keys: &[OneTimePreKeyPublic]) -> Result<(), BundleError> {
        let max = self.config.max_one_time_pre_keys;
        if pre_keys.len() > max {
            return Err(BundleError::InvalidArgument(format!(
                "too many one-time prekeys: at most {max} unused per device"
            )));
        }

        let mut seen = HashSet::with_capacity(pre_keys.len());
        for key in pre_keys {
            validate_id(&key.key_id, "keyId")?;
            if !seen.insert(key.key_id.as_str()) {
                return Err(BundleError::InvalidArgument(format!(
                    "duplicate keyId {}",
                    key.key_id
                )));
            }
        }

        Ok(())
    }
}

fn validate_id(id: &str, field: &str) -> Result<(), BundleError> {
    if id.is_empty() {
        return Err(BundleError::InvalidArgument(format!("{field} must not be empty")));
    }
    if id.len() > MAX_ID_LEN {
        return Err(BundleError::InvalidArgument(format!(
            "{field} longer than {MAX_ID_LEN} bytes"
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(BundleError::InvalidArgument(format!(
            "{field} contains control characters"
        )));
    }
    Ok(())
}
