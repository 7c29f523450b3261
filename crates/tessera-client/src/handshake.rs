//! X3DH handshake.
//!
//! The initiator combines its identity key and a fresh ephemeral key with
//! the responder's published keys; the responder recomputes the same four
//! DH outputs from the other side once the first message arrives.
//!
//! ```text
//! DH1 = DH(IK_a, SPK_b)
//! DH2 = DH(EK_a, IK_b)
//! DH3 = DH(EK_a, SPK_b)
//! DH4 = DH(EK_a, OPK_b)
//! SK  = HKDF(DH1 ‖ DH2 ‖ DH3 ‖ DH4)
//! ```

use rand::{CryptoRng, RngCore};
use tessera_crypto::{
    CryptoError, DhKeyPair, PublicKey, Role, derive_session_keys, verify_signature,
};
use tessera_proto::{HandshakeMessage, PreKeyBundle, RatchetHeader};
use zeroize::Zeroizing;

use crate::{SessionError, identity::DeviceIdentity, ratchet::RatchetState};

/// Size of the concatenated DH outputs.
const SHARED_SECRET_SIZE: usize = 4 * 32;

/// Result of starting a session from a peer's bundle.
#[derive(Debug)]
pub struct Initiation {
    /// Ratchet state for the new session
    pub ratchet: RatchetState,
    /// Handshake to attach to the first message
    pub handshake: HandshakeMessage,
    /// Ephemeral public key of this handshake
    pub ephemeral: PublicKey,
}

/// Start a session with the owner of `bundle`.
///
/// # Errors
///
/// - `InvalidBundleSignature` if the bundle carries a signing key and the
///   signed prekey signature does not verify
/// - `Crypto` if a bundle key yields a non-contributory DH output
pub fn initiate<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &DeviceIdentity,
    bundle: &PreKeyBundle,
) -> Result<Initiation, SessionError> {
    let signed_pre_key = PublicKey::from(bundle.signed_pre_key.public_key);
    if let Some(signing_key) = bundle.identity_signing_key {
        verify_signature(
            &signing_key.into(),
            signed_pre_key.as_bytes(),
            &bundle.signed_pre_key.signature.into(),
        )
        .map_err(|_| SessionError::InvalidBundleSignature)?;
    }

    let peer_identity = PublicKey::from(bundle.identity_key);
    let one_time_pre_key = PublicKey::from(bundle.one_time_pre_key.public_key);
    let ephemeral = DhKeyPair::generate(rng);

    let dh1 = identity.identity_key_pair().diffie_hellman(&signed_pre_key)?;
    let dh2 = ephemeral.diffie_hellman(&peer_identity)?;
    let dh3 = ephemeral.diffie_hellman(&signed_pre_key)?;
    let dh4 = ephemeral.diffie_hellman(&one_time_pre_key)?;
    let secret = concat([&dh1, &dh2, &dh3, &dh4]);

    let keys = derive_session_keys(&secret, Role::Initiator);
    let ratchet = RatchetState::new(keys, DhKeyPair::generate(rng), None);

    let handshake = HandshakeMessage {
        ephemeral_key: ephemeral.public_key().into(),
        identity_key: identity.identity_public().into(),
        used_pre_key_id: bundle.one_time_pre_key.key_id.clone(),
    };

    Ok(Initiation { ratchet, handshake, ephemeral: ephemeral.public_key() })
}

/// Complete a session started by a peer.
///
/// Consumes the named one-time prekey in `identity`. The caller persists
/// the identity only once the first message decrypts.
///
/// # Errors
///
/// - `MalformedHandshake` if the prekey id is empty or a peer key is unusable
/// - `PreKeyNotFound` / `PreKeyAlreadyUsed` for the named prekey
pub fn respond<R: RngCore + CryptoRng>(
    rng: &mut R,
    identity: &mut DeviceIdentity,
    handshake: &HandshakeMessage,
    header: &RatchetHeader,
) -> Result<RatchetState, SessionError> {
    if handshake.used_pre_key_id.is_empty() {
        return Err(SessionError::MalformedHandshake("empty prekey id".into()));
    }

    let peer_identity = PublicKey::from(handshake.identity_key);
    let peer_ephemeral = PublicKey::from(handshake.ephemeral_key);
    let one_time_pre_key = identity.pre_key(&handshake.used_pre_key_id)?.key_pair.clone();
    let signed_pre_key = identity.signed_pre_key_pair();

    let dh1 = malformed(signed_pre_key.diffie_hellman(&peer_identity))?;
    let dh2 = malformed(identity.identity_key_pair().diffie_hellman(&peer_ephemeral))?;
    let dh3 = malformed(signed_pre_key.diffie_hellman(&peer_ephemeral))?;
    let dh4 = malformed(one_time_pre_key.diffie_hellman(&peer_ephemeral))?;
    let secret = concat([&dh1, &dh2, &dh3, &dh4]);

    let keys = derive_session_keys(&secret, Role::Responder);
    identity.mark_pre_key_used(&handshake.used_pre_key_id);

    Ok(RatchetState::new(keys, DhKeyPair::generate(rng), Some(header.dh.into())))
}

/// `DH1 ‖ DH2 ‖ DH3 ‖ DH4`
fn concat(outputs: [&Zeroizing<[u8; 32]>; 4]) -> Zeroizing<Vec<u8>> {
    let mut secret = Zeroizing::new(Vec::with_capacity(SHARED_SECRET_SIZE));
    for output in outputs {
        secret.extend_from_slice(output.as_slice());
    }
    secret
}

fn malformed<T>(result: Result<T, CryptoError>) -> Result<T, SessionError> {
    result.map_err(|err| SessionError::MalformedHandshake(err.to_string()))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use tessera_proto::{OneTimePreKeyPublic, SignatureBytes};

    use super::*;
    use crate::ratchet::SkipPolicy;

    fn bundle_for(device: &DeviceIdentity) -> PreKeyBundle {
        let request = device.registration();
        PreKeyBundle {
            user_id: "bob".into(),
            device_id: device.device_id().into(),
            bundle_version: 2,
            identity_key: request.identity_key.unwrap(),
            identity_signing_key: request.identity_signing_key,
            signed_pre_key: request.signed_pre_key.unwrap(),
            one_time_pre_key: request.one_time_pre_keys[0].clone(),
        }
    }

    #[test]
    fn both_sides_agree() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let alice = DeviceIdentity::generate(&mut rng, 1);
        let mut bob = DeviceIdentity::generate(&mut rng, 2);
        let policy = SkipPolicy::default();

        let mut initiation = initiate(&mut rng, &alice, &bundle_for(&bob)).unwrap();
        let (header, sent) = initiation.ratchet.send().unwrap();

        let mut responder = respond(&mut rng, &mut bob, &initiation.handshake, &header).unwrap();
        let received = responder.receive(&mut rng, &header, &policy).unwrap();

        assert_eq!(sent, received);
        assert_eq!(bob.unused_pre_key_count(), 1);
        assert_eq!(initiation.ephemeral, PublicKey::from(initiation.handshake.ephemeral_key));
    }

    #[test]
    fn forged_signature_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let alice = DeviceIdentity::generate(&mut rng, 1);
        let bob = DeviceIdentity::generate(&mut rng, 1);

        let mut bundle = bundle_for(&bob);
        bundle.signed_pre_key.signature = SignatureBytes::new([7; 64]);

        assert!(matches!(
            initiate(&mut rng, &alice, &bundle),
            Err(SessionError::InvalidBundleSignature)
        ));
    }

    #[test]
    fn unsigned_bundle_is_accepted() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let alice = DeviceIdentity::generate(&mut rng, 1);
        let bob = DeviceIdentity::generate(&mut rng, 1);

        let mut bundle = bundle_for(&bob);
        bundle.identity_signing_key = None;

        assert!(initiate(&mut rng, &alice, &bundle).is_ok());
    }

    #[test]
    fn replayed_handshake_fails_on_used_key() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let alice = DeviceIdentity::generate(&mut rng, 1);
        let mut bob = DeviceIdentity::generate(&mut rng, 1);

        let mut initiation = initiate(&mut rng, &alice, &bundle_for(&bob)).unwrap();
        let (header, _) = initiation.ratchet.send().unwrap();
        respond(&mut rng, &mut bob, &initiation.handshake, &header).unwrap();

        let replay = respond(&mut rng, &mut bob, &initiation.handshake, &header);
        assert!(matches!(replay, Err(SessionError::PreKeyAlreadyUsed { .. })));
    }

    #[test]
    fn unknown_or_empty_prekey_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let alice = DeviceIdentity::generate(&mut rng, 1);
        let mut bob = DeviceIdentity::generate(&mut rng, 1);

        let mut bundle = bundle_for(&bob);
        bundle.one_time_pre_key = OneTimePreKeyPublic {
            key_id: "missing".into(),
            public_key: bundle.one_time_pre_key.public_key,
        };
        let mut initiation = initiate(&mut rng, &alice, &bundle).unwrap();
        let (header, _) = initiation.ratchet.send().unwrap();

        let result = respond(&mut rng, &mut bob, &initiation.handshake, &header);
        assert!(matches!(result, Err(SessionError::PreKeyNotFound { .. })));

        initiation.handshake.used_pre_key_id.clear();
        let result = respond(&mut rng, &mut bob, &initiation.handshake, &header);
        assert!(matches!(result, Err(SessionError::MalformedHandshake(_))));
    }

    #[test]
    fn low_order_ephemeral_is_malformed() {
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let alice = DeviceIdentity::generate(&mut rng, 1);
        let mut bob = DeviceIdentity::generate(&mut rng, 1);

        let mut initiation = initiate(&mut rng, &alice, &bundle_for(&bob)).unwrap();
        let (header, _) = initiation.ratchet.send().unwrap();
        initiation.handshake.ephemeral_key = tessera_proto::PublicKeyBytes::new([0; 32]);

        let result = respond(&mut rng, &mut bob, &initiation.handshake, &header);
        assert!(matches!(result, Err(SessionError::MalformedHandshake(_))));
        assert_eq!(bob.unused_pre_key_count(), 1);
    }
}
