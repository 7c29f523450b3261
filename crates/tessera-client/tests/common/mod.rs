//! Shared fixtures: an in-process key directory and seeded managers.

#![allow(dead_code)]

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tessera_client::{
    BundleDirectory, DirectoryError, MemoryKeyValueStore, SessionConfig, SessionManager,
};
use tessera_proto::{DeviceReceipt, PreKeyBundle, PublishDeviceRequest, TopUpRequest};
use tessera_server::{BundleError, DirectoryConfig, KeyDirectory, MemoryBundleStore};

pub type TestManager = SessionManager<MemoryKeyValueStore, LocalDirectory, ChaCha20Rng>;

/// The server's directory service called directly, as one user.
#[derive(Clone)]
pub struct LocalDirectory {
    directory: KeyDirectory<MemoryBundleStore>,
    user_id: String,
}

impl LocalDirectory {
    pub fn new(directory: &KeyDirectory<MemoryBundleStore>, user_id: &str) -> Self {
        Self { directory: directory.clone(), user_id: user_id.to_owned() }
    }
}

#[async_trait]
impl BundleDirectory for LocalDirectory {
    async fn register_device(
        &self,
        request: PublishDeviceRequest,
    ) -> Result<DeviceReceipt, DirectoryError> {
        self.directory.publish(&self.user_id, request).map_err(directory_error)
    }

    async fn fetch_bundle(&self, user_id: &str) -> Result<PreKeyBundle, DirectoryError> {
        self.directory.consume_one(user_id).map_err(directory_error)
    }

    async fn top_up(&self, request: TopUpRequest) -> Result<DeviceReceipt, DirectoryError> {
        let device_id = request
            .device_id
            .ok_or_else(|| DirectoryError::InvalidArgument("deviceId is required".into()))?;
        self.directory
            .top_up(&self.user_id, &device_id, request.one_time_pre_keys)
            .map_err(directory_error)
    }
}

fn directory_error(err: BundleError) -> DirectoryError {
    match err {
        BundleError::InvalidArgument(msg) => DirectoryError::InvalidArgument(msg),
        BundleError::Conflict { device_id } => DirectoryError::Conflict(device_id),
        BundleError::NotFound(msg) => DirectoryError::NotFound(msg),
        BundleError::Storage(err) => DirectoryError::Unavailable(err.to_string()),
    }
}

pub fn key_directory() -> KeyDirectory<MemoryBundleStore> {
    KeyDirectory::new(MemoryBundleStore::new(), DirectoryConfig::default())
}

pub fn manager(
    directory: &KeyDirectory<MemoryBundleStore>,
    user_id: &str,
    seed: u64,
) -> TestManager {
    manager_with(directory, user_id, seed, SessionConfig::default())
}

pub fn manager_with(
    directory: &KeyDirectory<MemoryBundleStore>,
    user_id: &str,
    seed: u64,
    config: SessionConfig,
) -> TestManager {
    SessionManager::with_rng(
        user_id,
        MemoryKeyValueStore::new(),
        LocalDirectory::new(directory, user_id),
        config,
        ChaCha20Rng::seed_from_u64(seed),
    )
}

/// Registered managers for two users sharing one directory.
pub async fn registered_pair(
    directory: &KeyDirectory<MemoryBundleStore>,
) -> (TestManager, TestManager) {
    let mut alice = manager(directory, "alice", 1);
    let mut bob = manager(directory, "bob", 2);
    alice.ensure_registered().await.unwrap();
    bob.ensure_registered().await.unwrap();
    (alice, bob)
}
