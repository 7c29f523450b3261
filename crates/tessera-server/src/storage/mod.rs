//! Storage abstraction for the key directory
//!
//! A store holds one [`DeviceBundle`] per `(user, device)`. All mutation goes
//! through closures that the store runs atomically: the closure sees the
//! current record, edits a copy, and the copy is written back only if the
//! closure succeeds. Two concurrent callers can never observe the same
//! record state and both write, which is what makes a prekey grant
//! single-use. The trait is synchronous.

mod error;
mod memory;
mod redb;

use std::collections::VecDeque;

pub use error::StorageError;
pub use memory::MemoryBundleStore;
use serde::{Deserialize, Serialize};
use tessera_proto::{DeviceStatus, PublicKeyBytes, SignedPreKeyPublic};

pub use self::redb::RedbBundleStore;

/// Granted key ids a bundle remembers for duplicate detection.
pub const MAX_RETAINED_USED_KEY_IDS: usize = 1000;

/// An unused one-time prekey held by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPreKey {
    /// Client-chosen identifier
    pub key_id: String,
    /// X25519 public key
    pub public_key: PublicKeyBytes,
}

/// Everything the directory knows about one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBundle {
    /// Owning user
    pub user_id: String,
    /// Device id, unique per user
    pub device_id: String,
    /// Active or revoked
    pub status: DeviceStatus,
    /// Incremented on every mutation
    pub bundle_version: u64,
    /// X25519 identity key
    pub identity_key: PublicKeyBytes,
    /// Ed25519 key that signed the signed prekey
    pub identity_signing_key: Option<PublicKeyBytes>,
    /// Signed prekey
    pub signed_pre_key: SignedPreKeyPublic,
    /// Unused one-time prekeys, oldest first. A granted key leaves this list.
    pub one_time_pre_keys: VecDeque<StoredPreKey>,
    /// Ids of the most recently granted keys, oldest first, at most
    /// [`MAX_RETAINED_USED_KEY_IDS`]
    #[serde(default)]
    pub used_pre_key_ids: VecDeque<String>,
    /// Store-wide write sequence of the last update; larger is fresher.
    /// Assigned by the store on every write.
    pub update_seq: u64,
}

impl DeviceBundle {
    /// Whether the bundle may be granted or topped up.
    pub fn is_active(&self) -> bool {
        self.status == DeviceStatus::Active
    }

    /// Number of one-time prekeys not yet granted.
    pub fn unused_pre_key_count(&self) -> usize {
        self.one_time_pre_keys.len()
    }

    /// Active with at least one unused one-time prekey.
    pub fn can_grant(&self) -> bool {
        self.is_active() && !self.one_time_pre_keys.is_empty()
    }

    /// Whether `key_id` is unused or among the retained granted ids.
    pub fn knows_key_id(&self, key_id: &str) -> bool {
        self.one_time_pre_keys.iter().any(|key| key.key_id == key_id)
            || self.used_pre_key_ids.iter().any(|id| id == key_id)
    }

    /// Remove the oldest unused prekey and remember its id.
    pub fn take_oldest_pre_key(&mut self) -> Option<StoredPreKey> {
        let key = self.one_time_pre_keys.pop_front()?;
        self.used_pre_key_ids.push_back(key.key_id.clone());
        while self.used_pre_key_ids.len() > MAX_RETAINED_USED_KEY_IDS {
            self.used_pre_key_ids.pop_front();
        }
        Some(key)
    }
}

/// Persistence for device bundles.
///
/// Must be Clone (shared between request handlers), Send + Sync, and
/// synchronous. Implementations share state via Arc, so clones see the same
/// records.
pub trait BundleStore: Clone + Send + Sync + 'static {
    /// Atomically read-modify-write one device record.
    ///
    /// `update` receives the current record (`None` if absent). When it
    /// returns `Ok`, the slot's final value is persisted: `Some` is written
    /// with a fresh `update_seq`, `None` removes the record. When it returns
    /// `Err`, nothing is written.
    fn update_device<T, E, F>(&self, user_id: &str, device_id: &str, update: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut Option<DeviceBundle>) -> Result<T, E>;

    /// Atomically pick the freshest eligible bundle of a user and update it.
    ///
    /// Among the user's records for which `eligible` holds, the one with the
    /// largest `update_seq` is passed to `update`. Returns `Ok(None)` when no
    /// record is eligible. On `Ok(Some(_))` the edited record is persisted
    /// with a fresh `update_seq`.
    fn update_freshest<T, E, P, F>(
        &self,
        user_id: &str,
        eligible: P,
        update: F,
    ) -> Result<Option<T>, E>
    where
        E: From<StorageError>,
        P: Fn(&DeviceBundle) -> bool,
        F: FnOnce(&mut DeviceBundle) -> Result<T, E>;

    /// Load one device record.
    fn load_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceBundle>, StorageError>;

    /// All device records of a user. Order is not guaranteed.
    fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceBundle>, StorageError>;
}
