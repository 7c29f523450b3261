//! Local persistence of device identity and sessions.
//!
//! [`KeyValueStore`] is the contract an embedding application implements
//! over its durable storage; [`SessionStore`] layers typed records on top.
//! Records are CBOR and are validated on load. A record that fails to decode
//! or validate is deleted and reported as absent, so the caller regenerates
//! it instead of failing on every use.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{identity::DeviceIdentity, session::Session};

/// Namespace holding one [`DeviceIdentity`] per local user.
pub const DEVICES_NAMESPACE: &str = "devices";

/// Namespace holding one [`Session`] per (local user, peer).
pub const SESSIONS_NAMESPACE: &str = "sessions";

/// Errors from the local key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Record could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the failure may clear up on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Opaque byte storage keyed by `(namespace, key)`.
pub trait KeyValueStore: Send + Sync {
    /// Read a value. `None` if absent.
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value, replacing any previous one.
    fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove a value. Removing an absent key is not an error.
    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
}

/// In-memory key-value store. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    entries: Arc<Mutex<HashMap<(String, String), Vec<u8>>>>,
}

impl MemoryKeyValueStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values across all namespaces.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    /// Whether the store holds no values.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<(String, String), Vec<u8>>>, StoreError> {
        self.entries.lock().map_err(|_| StoreError::Io("store lock poisoned".into()))
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.get(&(namespace.to_owned(), key.to_owned())).cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.lock()?.insert((namespace.to_owned(), key.to_owned()), value);
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(&(namespace.to_owned(), key.to_owned()));
        Ok(())
    }
}

/// Typed identity and session records of one local user.
pub struct SessionStore<K: KeyValueStore> {
    kv: K,
    user_id: String,
}

impl<K: KeyValueStore> SessionStore<K> {
    /// Records of `user_id` in `kv`.
    pub fn new(kv: K, user_id: impl Into<String>) -> Self {
        Self { kv, user_id: user_id.into() }
    }

    /// Local user these records belong to.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Underlying key-value store.
    pub fn kv(&self) -> &K {
        &self.kv
    }

    /// Load this user's device identity.
    ///
    /// A stored identity that does not decode or is not well formed is
    /// deleted and reported as absent.
    pub fn load_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        self.load(DEVICES_NAMESPACE, &self.user_id, DeviceIdentity::is_well_formed)
    }

    /// Persist this user's device identity.
    pub fn save_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        self.kv.put(DEVICES_NAMESPACE, &self.user_id, encode(identity)?)
    }

    /// Load the session with `peer`.
    ///
    /// A stored session that does not decode or whose ratchet state is
    /// inconsistent is deleted and reported as absent.
    pub fn load_session(&self, peer: &str) -> Result<Option<Session>, StoreError> {
        self.load(SESSIONS_NAMESPACE, &self.session_key(peer), Session::is_well_formed)
    }

    /// Persist the session with `peer`.
    pub fn save_session(&self, peer: &str, session: &Session) -> Result<(), StoreError> {
        self.kv.put(SESSIONS_NAMESPACE, &self.session_key(peer), encode(session)?)
    }

    /// Delete the session with `peer`.
    pub fn delete_session(&self, peer: &str) -> Result<(), StoreError> {
        self.kv.delete(SESSIONS_NAMESPACE, &self.session_key(peer))
    }

    /// Key of the session with `peer` in [`SESSIONS_NAMESPACE`]:
    /// `len(user) ":" user "/" peer`. The length prefix keeps the split
    /// unambiguous when ids contain `/`.
    pub fn session_key(&self, peer: &str) -> String {
        format!("{}:{}/{peer}", self.user_id.len(), self.user_id)
    }

    fn load<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
        is_valid: impl Fn(&T) -> bool,
    ) -> Result<Option<T>, StoreError> {
        let Some(bytes) = self.kv.get(namespace, key)? else {
            return Ok(None);
        };

        match ciborium::from_reader::<T, _>(bytes.as_slice()) {
            Ok(record) if is_valid(&record) => Ok(Some(record)),
            Ok(_) => {
                tracing::warn!(namespace, key, "stored record failed validation, discarding");
                self.kv.delete(namespace, key)?;
                Ok(None)
            },
            Err(err) => {
                tracing::warn!(
                    namespace,
                    key,
                    error = %err,
                    "stored record unreadable, discarding"
                );
                self.kv.delete(namespace, key)?;
                Ok(None)
            },
        }
    }
}

fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(record, &mut bytes)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(bytes)
}
