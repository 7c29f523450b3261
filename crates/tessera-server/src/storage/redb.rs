//! Redb-backed durable bundle store.
//!
//! Each update runs in a single Redb write transaction. Redb serializes
//! write transactions, so update closures never interleave, and a failed
//! closure drops the transaction without committing. State survives
//! restarts.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};

use super::{BundleStore, DeviceBundle, StorageError};

/// Table: bundles
/// Key: `user_id ‖ 0x00 ‖ device_id` (UTF-8)
/// Value: CBOR-encoded `DeviceBundle`
const BUNDLES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("bundles");

/// Table: meta
/// Key: counter name
/// Value: counter value
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Last assigned `update_seq`
const UPDATE_SEQ: &str = "update_seq";

/// Durable bundle store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbBundleStore {
    db: Arc<Database>,
}

impl RedbBundleStore {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (BUNDLES, META).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(BUNDLES).map_err(io)?;
            let _ = txn.open_table(META).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl BundleStore for RedbBundleStore {
    fn update_device<T, E, F>(&self, user_id: &str, device_id: &str, update: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut Option<DeviceBundle>) -> Result<T, E>,
    {
        let key = bundle_key(user_id, device_id);
        let txn = self.db.begin_write().map_err(io)?;

        let result = {
            let mut table = txn.open_table(BUNDLES).map_err(io)?;

            let existing = table.get(key.as_slice()).map_err(io)?;
            let mut slot = existing.map(|value| decode(value.value())).transpose()?;

            // Dropping `txn` on error aborts the transaction.
            let result = update(&mut slot)?;

            match slot {
                Some(mut bundle) => {
                    bundle.update_seq = next_update_seq(&txn)?;
                    let bytes = encode(&bundle)?;
                    table.insert(key.as_slice(), bytes.as_slice()).map_err(io)?;
                },
                None => {
                    table.remove(key.as_slice()).map_err(io)?;
                },
            }

            result
        };

        txn.commit().map_err(io)?;
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
        let (start, end) = user_range(user_id);
        let txn = self.db.begin_write().map_err(io)?;

        let result = {
            let mut table = txn.open_table(BUNDLES).map_err(io)?;

            let mut freshest: Option<DeviceBundle> = None;
            for entry in table.range(start.as_slice()..end.as_slice()).map_err(io)? {
                let (_, value) = entry.map_err(io)?;
                let bundle = decode(value.value())?;
                if eligible(&bundle)
                    && freshest.as_ref().is_none_or(|best| bundle.update_seq > best.update_seq)
                {
                    freshest = Some(bundle);
                }
            }

            let Some(mut bundle) = freshest else {
                return Ok(None);
            };

            let result = update(&mut bundle)?;

            bundle.update_seq = next_update_seq(&txn)?;
            let key = bundle_key(&bundle.user_id, &bundle.device_id);
            let bytes = encode(&bundle)?;
            table.insert(key.as_slice(), bytes.as_slice()).map_err(io)?;

            result
        };

        txn.commit().map_err(io)?;
        Ok(Some(result))
    }

    fn load_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceBundle>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(BUNDLES).map_err(io)?;

        let key = bundle_key(user_id, device_id);
        let value = table.get(key.as_slice()).map_err(io)?;
        value.map(|value| decode(value.value())).transpose()
    }

    fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceBundle>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(BUNDLES).map_err(io)?;

        let (start, end) = user_range(user_id);
        let mut devices = Vec::new();
        for entry in table.range(start.as_slice()..end.as_slice()).map_err(io)? {
            let (_, value) = entry.map_err(io)?;
            devices.push(decode(value.value())?);
        }

        Ok(devices)
    }
}

fn io(err: impl std::fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

fn next_update_seq(txn: &WriteTransaction) -> Result<u64, StorageError> {
    let mut meta = txn.open_table(META).map_err(io)?;
    let current = meta.get(UPDATE_SEQ).map_err(io)?.map(|value| value.value()).unwrap_or(0);
    let next = current + 1;
    meta.insert(UPDATE_SEQ, next).map_err(io)?;
    Ok(next)
}

fn encode(bundle: &DeviceBundle) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(bundle, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> Result<DeviceBundle, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Key: `user_id ‖ 0x00 ‖ device_id`. Ids never contain NUL, so a user's
/// records form one contiguous key range.
fn bundle_key(user_id: &str, device_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_id.len() + 1 + device_id.len());
    key.extend_from_slice(user_id.as_bytes());
    key.push(0x00);
    key.extend_from_slice(device_id.as_bytes());
    key
}

/// Half-open key range `[user ‖ 0x00, user ‖ 0x01)` covering every device of
/// `user_id`.
fn user_range(user_id: &str) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(user_id.len() + 1);
    start.extend_from_slice(user_id.as_bytes());
    let mut end = start.clone();
    start.push(0x00);
    end.push(0x01);
    (start, end)
}
