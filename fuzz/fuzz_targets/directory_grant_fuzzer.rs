//! Fuzz target for KeyDirectory grant bookkeeping
//!
//! Applies arbitrary publish / grant / top-up / revoke sequences to one
//! user's devices.
//!
//! # Invariants
//!
//! - No (device, key id) pair is ever granted twice
//! - Revoked devices are never granted
//! - Unused prekeys per device never exceed the cap
//! - Bundle versions never decrease

#![no_main]

use std::collections::{HashMap, HashSet};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tessera_proto::{
    DeviceStatus, OneTimePreKeyPublic, PublicKeyBytes, PublishDeviceRequest, SignatureBytes,
    SignedPreKeyPublic,
};
use tessera_server::{DirectoryConfig, KeyDirectory, MemoryBundleStore};

const USER: &str = "user";
const CAP: usize = 16;

#[derive(Debug, Arbitrary)]
enum Operation {
    Publish { device: u8, keys: u8 },
    Grant,
    TopUp { device: u8, keys: u8 },
    Revoke { device: u8 },
}

fuzz_target!(|operations: Vec<Operation>| {
    let directory = KeyDirectory::new(
        MemoryBundleStore::new(),
        DirectoryConfig { max_one_time_pre_keys: CAP },
    );
    let mut granted = HashSet::new();
    let mut versions: HashMap<String, u64> = HashMap::new();
    let mut next_key = 0u32;
    let mut fresh_keys = |count: u8| -> Vec<OneTimePreKeyPublic> {
        (0..count % 24)
            .map(|_| {
                next_key += 1;
                OneTimePreKeyPublic {
                    key_id: format!("k{next_key}"),
                    public_key: PublicKeyBytes::new([1; 32]),
                }
            })
            .collect()
    };

    for operation in operations.into_iter().take(128) {
        match operation {
            Operation::Publish { device, keys } => {
                let request = PublishDeviceRequest {
                    device_id: Some(format!("d{}", device % 4)),
                    identity_key: Some(PublicKeyBytes::new([2; 32])),
                    identity_signing_key: None,
                    signed_pre_key: Some(SignedPreKeyPublic {
                        public_key: PublicKeyBytes::new([3; 32]),
                        signature: SignatureBytes::new([4; 64]),
                    }),
                    one_time_pre_keys: fresh_keys(keys),
                    bundle_version: None,
                };
                let _ = directory.publish(USER, request);
            },
            Operation::Grant => {
                if let Ok(bundle) = directory.consume_one(USER) {
                    let record = directory
                        .device(USER, &bundle.device_id)
                        .expect("store readable")
                        .expect("granted device exists");
                    assert_eq!(record.status, DeviceStatus::Active);
                    assert!(
                        granted.insert((bundle.device_id, bundle.one_time_pre_key.key_id)),
                        "prekey granted twice"
                    );
                }
            },
            Operation::TopUp { device, keys } => {
                let _ = directory.top_up(USER, &format!("d{}", device % 4), fresh_keys(keys));
            },
            Operation::Revoke { device } => {
                let _ = directory.revoke(USER, &format!("d{}", device % 4));
            },
        }

        for device in 0..4 {
            let device_id = format!("d{device}");
            let Some(record) = directory.device(USER, &device_id).expect("store readable") else {
                continue;
            };
            assert!(record.unused_pre_key_count() <= CAP);
            let last = versions.entry(device_id).or_insert(0);
            assert!(record.bundle_version >= *last, "bundle version went backwards");
            *last = record.bundle_version;
        }
    }
});
