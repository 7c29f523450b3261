//! Device identity and prekey inventory.
//!
//! A [`DeviceIdentity`] is created once per device and never leaves it. It
//! holds the long-term X25519 identity key, the Ed25519 key that signs the
//! signed prekey, the signed prekey itself, and the one-time prekeys whose
//! public halves are published to the key directory.

use std::collections::HashSet;

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tessera_crypto::{DhKeyPair, PublicKey, Signature, SigningKeyPair, verify_signature};
use tessera_proto::{OneTimePreKeyPublic, PublishDeviceRequest, SignedPreKeyPublic};

use crate::SessionError;

/// Consumed one-time prekeys kept so that a replayed handshake is reported
/// as [`SessionError::PreKeyAlreadyUsed`]. Older ones are forgotten.
pub const MAX_RETAINED_USED_PRE_KEYS: usize = 200;

/// A one-time prekey with its secret half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// Identifier published with the public half
    pub key_id: String,
    /// X25519 key pair
    pub key_pair: DhKeyPair,
    /// Set once a handshake consumed the key
    pub used: bool,
}

/// The signed prekey and its signature under the identity signing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// X25519 key pair
    pub key_pair: DhKeyPair,
    /// Ed25519 signature over the public half
    pub signature: Signature,
}

/// All private key material of one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    device_id: String,
    identity: DhKeyPair,
    signing: SigningKeyPair,
    signed_pre_key: SignedPreKey,
    one_time_pre_keys: Vec<OneTimePreKey>,
    /// Set once the directory has accepted the registration
    #[serde(default)]
    registered: bool,
}

impl DeviceIdentity {
    /// Generate a device with a fresh identity, signed prekey and
    /// `pre_key_count` one-time prekeys.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, pre_key_count: usize) -> Self {
        let identity = DhKeyPair::generate(rng);
        let signing = SigningKeyPair::generate(rng);

        let key_pair = DhKeyPair::generate(rng);
        let signature = signing.sign(key_pair.public_key().as_bytes());

        let mut device = Self {
            device_id: random_id(rng),
            identity,
            signing,
            signed_pre_key: SignedPreKey { key_pair, signature },
            one_time_pre_keys: Vec::new(),
            registered: false,
        };
        device.generate_pre_keys(rng, pre_key_count);
        device
    }

    /// Device id (UUID v4).
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// X25519 identity public key.
    pub fn identity_public(&self) -> PublicKey {
        self.identity.public_key()
    }

    /// Ed25519 verifying key of the signed prekey.
    pub fn signing_public(&self) -> PublicKey {
        self.signing.verifying_key()
    }

    /// Identity key pair, for the handshake.
    pub(crate) fn identity_key_pair(&self) -> &DhKeyPair {
        &self.identity
    }

    /// Signed prekey pair, for the handshake.
    pub(crate) fn signed_pre_key_pair(&self) -> &DhKeyPair {
        &self.signed_pre_key.key_pair
    }

    /// Whether the directory has accepted this device.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Record that the directory accepted this device.
    pub fn mark_registered(&mut self) {
        self.registered = true;
    }

    /// Registration body carrying every unused one-time prekey.
    pub fn registration(&self) -> PublishDeviceRequest {
        PublishDeviceRequest {
            device_id: Some(self.device_id.clone()),
            identity_key: Some(self.identity_public().into()),
            identity_signing_key: Some(self.signing_public().into()),
            signed_pre_key: Some(SignedPreKeyPublic {
                public_key: self.signed_pre_key.key_pair.public_key().into(),
                signature: self.signed_pre_key.signature.into(),
            }),
            one_time_pre_keys: self
                .one_time_pre_keys
                .iter()
                .filter(|key| !key.used)
                .map(OneTimePreKey::public)
                .collect(),
            bundle_version: None,
        }
    }

    /// Append `count` fresh one-time prekeys and return their public halves
    /// for upload.
    pub fn generate_pre_keys<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        count: usize,
    ) -> Vec<OneTimePreKeyPublic> {
        let start = self.one_time_pre_keys.len();
        for _ in 0..count {
            self.one_time_pre_keys.push(OneTimePreKey {
                key_id: random_id(rng),
                key_pair: DhKeyPair::generate(rng),
                used: false,
            });
        }
        self.one_time_pre_keys[start..].iter().map(OneTimePreKey::public).collect()
    }

    /// Number of one-time prekeys not yet consumed by a handshake.
    pub fn unused_pre_key_count(&self) -> usize {
        self.one_time_pre_keys.iter().filter(|key| !key.used).count()
    }

    /// Look up an unused one-time prekey.
    ///
    /// # Errors
    ///
    /// - `PreKeyNotFound` if this device never held the key or forgot it
    /// - `PreKeyAlreadyUsed` if a handshake already consumed it
    pub fn pre_key(&self, key_id: &str) -> Result<&OneTimePreKey, SessionError> {
        let key = self
            .one_time_pre_keys
            .iter()
            .find(|key| key.key_id == key_id)
            .ok_or_else(|| SessionError::PreKeyNotFound { key_id: key_id.to_owned() })?;

        if key.used {
            return Err(SessionError::PreKeyAlreadyUsed { key_id: key_id.to_owned() });
        }
        Ok(key)
    }

    /// Mark a one-time prekey consumed and forget the oldest consumed keys
    /// beyond [`MAX_RETAINED_USED_PRE_KEYS`].
    pub fn mark_pre_key_used(&mut self, key_id: &str) {
        if let Some(key) = self.one_time_pre_keys.iter_mut().find(|key| key.key_id == key_id) {
            key.used = true;
        }

        let used = self.one_time_pre_keys.iter().filter(|key| key.used).count();
        let mut excess = used.saturating_sub(MAX_RETAINED_USED_PRE_KEYS);
        self.one_time_pre_keys.retain(|key| {
            if key.used && excess > 0 {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Structural check applied when loading from storage: the signed
    /// prekey signature verifies and key ids are non-empty and unique.
    pub fn is_well_formed(&self) -> bool {
        if self.device_id.is_empty() {
            return false;
        }

        let signed = self.signed_pre_key.key_pair.public_key();
        let signature = &self.signed_pre_key.signature;
        if verify_signature(&self.signing_public(), signed.as_bytes(), signature).is_err() {
            return false;
        }

        let mut seen = HashSet::new();
        self.one_time_pre_keys.iter().all(|key| !key.key_id.is_empty() && seen.insert(&key.key_id))
    }
}

impl OneTimePreKey {
    /// Public half as published to the directory.
    pub fn public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            key_id: self.key_id.clone(),
            public_key: self.key_pair.public_key().into(),
        }
    }
}

/// Random UUID v4 string drawn from `rng`.
fn random_id<R: RngCore + CryptoRng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn identity(count: usize) -> DeviceIdentity {
        DeviceIdentity::generate(&mut ChaCha20Rng::seed_from_u64(7), count)
    }

    #[test]
    fn generated_identity_is_well_formed() {
        let device = identity(20);

        assert!(device.is_well_formed());
        assert!(!device.is_registered());
        assert_eq!(device.unused_pre_key_count(), 20);
        assert_eq!(uuid::Uuid::parse_str(device.device_id()).unwrap().get_version_num(), 4);
    }

    #[test]
    fn registration_carries_unused_keys() {
        let mut device = identity(3);
        let first = device.one_time_pre_keys[0].key_id.clone();
        device.mark_pre_key_used(&first);

        let request = device.registration();

        assert_eq!(request.device_id.as_deref(), Some(device.device_id()));
        assert_eq!(request.one_time_pre_keys.len(), 2);
        assert!(request.one_time_pre_keys.iter().all(|key| key.key_id != first));
        assert!(request.identity_signing_key.is_some());
    }

    #[test]
    fn pre_key_lookup_distinguishes_missing_and_used() {
        let mut device = identity(1);
        let key_id = device.one_time_pre_keys[0].key_id.clone();

        assert!(device.pre_key(&key_id).is_ok());
        device.mark_pre_key_used(&key_id);

        assert!(matches!(device.pre_key(&key_id), Err(SessionError::PreKeyAlreadyUsed { .. })));
        assert!(matches!(device.pre_key("nope"), Err(SessionError::PreKeyNotFound { .. })));
    }

    #[test]
    fn generated_keys_extend_inventory() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let mut device = DeviceIdentity::generate(&mut rng, 2);

        let added = device.generate_pre_keys(&mut rng, 5);

        assert_eq!(added.len(), 5);
        assert_eq!(device.unused_pre_key_count(), 7);
        assert!(device.is_well_formed());
    }

    #[test]
    fn used_keys_are_pruned_oldest_first() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let mut device = DeviceIdentity::generate(&mut rng, MAX_RETAINED_USED_PRE_KEYS + 2);
        let ids: Vec<String> = device.one_time_pre_keys.iter().map(|k| k.key_id.clone()).collect();

        for id in &ids {
            device.mark_pre_key_used(id);
        }

        assert_eq!(device.one_time_pre_keys.len(), MAX_RETAINED_USED_PRE_KEYS);
        assert!(matches!(device.pre_key(&ids[0]), Err(SessionError::PreKeyNotFound { .. })));
        assert!(matches!(
            device.pre_key(&ids[ids.len() - 1]),
            Err(SessionError::PreKeyAlreadyUsed { .. })
        ));
    }

    #[test]
    fn tampered_signature_is_not_well_formed() {
        let mut device = identity(1);
        device.signed_pre_key.signature = Signature::from_bytes([0u8; 64]);

        assert!(!device.is_well_formed());
    }
}
