//! Shared fixtures for directory tests.

#![allow(dead_code)]

use tessera_proto::{
    OneTimePreKeyPublic, PublicKeyBytes, PublishDeviceRequest, SignatureBytes, SignedPreKeyPublic,
};

pub fn pre_keys(prefix: &str, count: usize) -> Vec<OneTimePreKeyPublic> {
    (0..count)
        .map(|i| OneTimePreKeyPublic {
            key_id: format!("{prefix}-{i}"),
            public_key: PublicKeyBytes::new([(i % 251) as u8 + 1; 32]),
        })
        .collect()
}

pub fn publish_request(device_id: &str, keys: Vec<OneTimePreKeyPublic>) -> PublishDeviceRequest {
    PublishDeviceRequest {
        device_id: Some(device_id.into()),
        identity_key: Some(PublicKeyBytes::new([0xAA; 32])),
        identity_signing_key: Some(PublicKeyBytes::new([0xAB; 32])),
        signed_pre_key: Some(SignedPreKeyPublic {
            public_key: PublicKeyBytes::new([0xBB; 32]),
            signature: SignatureBytes::new([0xCC; 64]),
        }),
        one_time_pre_keys: keys,
        bundle_version: None,
    }
}
