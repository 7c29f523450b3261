#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use super::{BundleStore, DeviceBundle, StorageError};

/// In-memory bundle store for tests and single-process deployments.
///
/// All state sits behind one `Arc<Mutex<_>>`, so every update closure runs
/// with exclusive access to the whole store. Clones share the same state.
#[derive(Clone)]
pub struct MemoryBundleStore {
    inner: Arc<Mutex<MemoryBundleStoreInner>>,
}

#[derive(Default)]
struct MemoryBundleStoreInner {
    /// user id -> device id -> bundle
    bundles: HashMap<String, HashMap<String, DeviceBundle>>,

    /// Last assigned `update_seq`
    last_seq: u64,
}

impl MemoryBundleStoreInner {
    fn stamp_and_insert(&mut self, mut bundle: DeviceBundle) {
        self.last_seq += 1;
        bundle.update_seq = self.last_seq;
        self.bundles
            .entry(bundle.user_id.clone())
            .or_default()
            .insert(bundle.device_id.clone(), bundle);
    }

    fn remove(&mut self, user_id: &str, device_id: &str) {
        if let Some(devices) = self.bundles.get_mut(user_id) {
            devices.remove(device_id);
            if devices.is_empty() {
                self.bundles.remove(user_id);
            }
        }
    }
}

impl MemoryBundleStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryBundleStoreInner::default())) }
    }

    /// Number of stored device records across all users.
    pub fn device_count(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.bundles.values().map(HashMap::len).sum())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryBundleStoreInner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl Default for MemoryBundleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleStore for MemoryBundleStore {
    fn update_device<T, E, F>(&self, user_id: &str, device_id: &str, update: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut Option<DeviceBundle>) -> Result<T, E>,
    {
        let mut inner = self.lock()?;

        let mut slot =
            inner.bundles.get(user_id).and_then(|devices| devices.get(device_id)).cloned();
        let result = update(&mut slot)?;

        match slot {
            Some(bundle) => inner.stamp_and_insert(bundle),
            None => inner.remove(user_id, device_id),
        }

        Ok(result)
    }

    fn update_freshest<T, E, P, F>(
        &self,
        user_id: &str,
        eligible: P,
        update: F,
    ) -> Result<Option<T>, E>
    where
        E: From<StorageError>,
        P: Fn(&DeviceBundle) -> bool,
        F: FnOnce(&mut DeviceBundle) -> Result<T, E>,
    {
        let mut inner = self.lock()?;

        let freshest = inner
            .bundles
            .get(user_id)
            .and_then(|devices| {
                devices.values().filter(|bundle| eligible(bundle)).max_by_key(|b| b.update_seq)
            })
            .cloned();
        let Some(mut bundle) = freshest else {
            return Ok(None);
        };

        let result = update(&mut bundle)?;
        inner.stamp_and_insert(bundle);

        Ok(Some(result))
    }

    fn load_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceBundle>, StorageError> {
        let inner = self.lock()?;
        Ok(inner.bundles.get(user_id).and_then(|devices| devices.get(device_id)).cloned())
    }

    fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceBundle>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .bundles
            .get(user_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use tessera_proto::{DeviceStatus, PublicKeyBytes, SignatureBytes, SignedPreKeyPublic};

    use super::*;

    fn bundle(user_id: &str, device_id: &str) -> DeviceBundle {
        DeviceBundle {
            user_id: user_id.into(),
            device_id: device_id.into(),
            status: DeviceStatus::Active,
            bundle_version: 1,
            identity_key: PublicKeyBytes::new([1; 32]),
            identity_signing_key: None,
            signed_pre_key: SignedPreKeyPublic {
                public_key: PublicKeyBytes::new([2; 32]),
                signature: SignatureBytes::new([3; 64]),
            },
            one_time_pre_keys: VecDeque::new(),
            used_pre_key_ids: VecDeque::new(),
            update_seq: 0,
        }
    }

    fn insert(store: &MemoryBundleStore, user_id: &str, device_id: &str) {
        store
            .update_device::<_, StorageError, _>(user_id, device_id, |slot| {
                *slot = Some(bundle(user_id, device_id));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn writes_assign_increasing_sequence() {
        let store = MemoryBundleStore::new();
        insert(&store, "alice", "a");
        insert(&store, "alice", "b");

        let a = store.load_device("alice", "a").unwrap().unwrap();
        let b = store.load_device("alice", "b").unwrap().unwrap();
        assert!(b.update_seq > a.update_seq);
    }

    #[test]
    fn failed_update_writes_nothing() {
        let store = MemoryBundleStore::new();
        insert(&store, "alice", "a");
        let before = store.load_device("alice", "a").unwrap();

        let result: Result<(), StorageError> = store.update_device("alice", "a", |slot| {
            if let Some(bundle) = slot.as_mut() {
                bundle.bundle_version = 99;
            }
            Err(StorageError::Io("refused".into()))
        });

        assert!(result.is_err());
        assert_eq!(store.load_device("alice", "a").unwrap(), before);
    }

    #[test]
    fn clearing_slot_removes_record() {
        let store = MemoryBundleStore::new();
        insert(&store, "alice", "a");

        store
            .update_device::<_, StorageError, _>("alice", "a", |slot| {
                *slot = None;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.device_count().unwrap(), 0);
    }

    #[test]
    fn freshest_picks_latest_eligible() {
        let store = MemoryBundleStore::new();
        insert(&store, "alice", "old");
        insert(&store, "alice", "new");
        insert(&store, "bob", "other");

        let picked: Option<String> = store
            .update_freshest::<_, StorageError, _, _>(
                "alice",
                |_| true,
                |bundle| Ok(bundle.device_id.clone()),
            )
            .unwrap();
        assert_eq!(picked.as_deref(), Some("new"));

        let skipped: Option<String> = store
            .update_freshest::<_, StorageError, _, _>(
                "alice",
                |bundle| bundle.device_id != "new",
                |bundle| Ok(bundle.device_id.clone()),
            )
            .unwrap();
        assert_eq!(skipped.as_deref(), Some("old"));
    }

    #[test]
    fn freshest_of_unknown_user_is_none() {
        let store = MemoryBundleStore::new();
        let picked = store
            .update_freshest::<(), StorageError, _, _>("nobody", |_| true, |_| Ok(()))
            .unwrap();
        assert!(picked.is_none());
    }
}
