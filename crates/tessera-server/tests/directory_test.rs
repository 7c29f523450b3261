//! Key directory behavior against both store backends.

mod common;

use std::{collections::HashSet, thread};

use common::{pre_keys, publish_request};
use tempfile::tempdir;
use tessera_server::{
    BundleError, BundleStore, DirectoryConfig, KeyDirectory, MemoryBundleStore, RedbBundleStore,
};

fn memory_directory() -> KeyDirectory<MemoryBundleStore> {
    KeyDirectory::new(MemoryBundleStore::new(), DirectoryConfig::default())
}

fn register_consume_top_up<S: BundleStore>(directory: &KeyDirectory<S>) {
    // Alice registers with one prekey
    let receipt =
        directory.publish("alice", publish_request("phone", pre_keys("first", 1))).unwrap();
    assert_eq!(receipt.one_time_pre_key_count, 1);

    // Bob's first fetch consumes it
    let grant = directory.consume_one("alice").unwrap();
    assert_eq!(grant.one_time_pre_key.key_id, "first-0");
    assert_eq!(grant.user_id, "alice");
    assert!(grant.identity_signing_key.is_some());

    // Second fetch finds nothing
    assert!(matches!(directory.consume_one("alice"), Err(BundleError::NotFound(_))));

    // Alice tops up five keys
    let receipt = directory.top_up("alice", "phone", pre_keys("second", 5)).unwrap();
    assert_eq!(receipt.one_time_pre_key_count, 5);

    // Bob's next fetch succeeds with a new key id
    let grant = directory.consume_one("alice").unwrap();
    assert_eq!(grant.one_time_pre_key.key_id, "second-0");
    assert!(grant.bundle_version > receipt.bundle_version);
}

fn concurrent_grants<S: BundleStore>(directory: &KeyDirectory<S>, grants: usize) {
    directory.publish("bob", publish_request("phone", pre_keys("k", grants))).unwrap();

    let results: Vec<Result<String, BundleError>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..=grants)
            .map(|_| {
                scope.spawn(|| {
                    directory.consume_one("bob").map(|grant| grant.one_time_pre_key.key_id)
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let granted: Vec<&String> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let distinct: HashSet<&String> = granted.iter().copied().collect();
    assert_eq!(granted.len(), grants, "every key granted exactly once");
    assert_eq!(distinct.len(), grants, "no key granted twice");

    let not_found = results.iter().filter(|r| matches!(r, Err(BundleError::NotFound(_))));
    assert_eq!(not_found.count(), 1);
}

#[test]
fn test_scenario_memory() {
    register_consume_top_up(&memory_directory());
}

#[test]
fn test_scenario_redb() {
    let dir = tempdir().unwrap();
    let store = RedbBundleStore::open(dir.path().join("bundles.redb")).unwrap();
    register_consume_top_up(&KeyDirectory::new(store, DirectoryConfig::default()));
}

#[test]
fn test_concurrent_grants_memory() {
    concurrent_grants(&memory_directory(), 32);
}

#[test]
fn test_concurrent_grants_redb() {
    let dir = tempdir().unwrap();
    let store = RedbBundleStore::open(dir.path().join("bundles.redb")).unwrap();
    concurrent_grants(&KeyDirectory::new(store, DirectoryConfig::default()), 16);
}

#[test]
fn test_revoked_only_device_is_not_found() {
    let directory = memory_directory();
    directory.publish("alice", publish_request("phone", pre_keys("k", 3))).unwrap();
    directory.revoke("alice", "phone").unwrap();

    assert!(matches!(directory.consume_one("alice"), Err(BundleError::NotFound(_))));
}

#[test]
fn test_revoked_device_is_skipped_for_active_one() {
    let directory = memory_directory();
    directory.publish("alice", publish_request("laptop", pre_keys("l", 3))).unwrap();
    directory.publish("alice", publish_request("phone", pre_keys("p", 3))).unwrap();
    directory.revoke("alice", "phone").unwrap();

    assert_eq!(directory.consume_one("alice").unwrap().device_id, "laptop");
}

#[test]
fn test_custom_cap_is_enforced() {
    let directory =
        KeyDirectory::new(MemoryBundleStore::new(), DirectoryConfig { max_one_time_pre_keys: 3 });

    assert!(matches!(
        directory.publish("alice", publish_request("phone", pre_keys("k", 4))),
        Err(BundleError::InvalidArgument(_))
    ));
    directory.publish("alice", publish_request("phone", pre_keys("k", 3))).unwrap();
    assert!(matches!(
        directory.top_up("alice", "phone", pre_keys("j", 1)),
        Err(BundleError::InvalidArgument(_))
    ));
}
