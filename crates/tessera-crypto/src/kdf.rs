//! Session key schedule using HKDF

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{ChainKey, RootKey};

/// Label for the handshake output split
const X3DH_LABEL: &[u8] = b"tessera:x3dh:v1";

/// Label for DH ratchet root steps
const ROOT_LABEL: &[u8] = b"tessera:ratchet:root:v1";

/// HKDF salt for the handshake. 32 zero bytes, the same value HKDF-SHA256
/// uses when no salt is supplied.
const HANDSHAKE_SALT: [u8; 32] = [0u8; 32];

/// Which side of the handshake a party played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    /// Fetched the peer's bundle and sent the first message.
    Initiator,
    /// Owns the consumed one-time prekey.
    Responder,
}

/// Keys both parties derive from the handshake secret.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    /// Initial root key
    pub root_key: RootKey,
    /// Chain this party sends on
    pub send_chain: ChainKey,
    /// Chain this party receives on
    pub recv_chain: ChainKey,
}

/// Split the handshake secret into a root key and two directional chains.
///
/// The initiator sends on the initiator→responder chain and the responder on
/// the other one, so both roles derived from the same secret have mirrored
/// `send_chain`/`recv_chain`.
pub fn derive_session_keys(shared_secret: &[u8], role: Role) -> SessionKeys {
    let hkdf = Hkdf::<Sha256>::new(Some(&HANDSHAKE_SALT), shared_secret);

    let mut output = Zeroizing::new([0u8; 96]);
    let Ok(()) = hkdf.expand(X3DH_LABEL, output.as_mut_slice()) else {
        unreachable!("96 bytes is a valid HKDF-SHA256 output length");
    };

    let root_key = RootKey::from_bytes(split(output.as_slice(), 0));
    let initiator_chain = ChainKey::from_bytes(split(output.as_slice(), 1));
    let responder_chain = ChainKey::from_bytes(split(output.as_slice(), 2));

    match role {
        Role::Initiator => {
            SessionKeys { root_key, send_chain: initiator_chain, recv_chain: responder_chain }
        },
        Role::Responder => {
            SessionKeys { root_key, send_chain: responder_chain, recv_chain: initiator_chain }
        },
    }
}

/// DH ratchet root step: mix `dh_output` into the root key, yielding the
/// next root key and a fresh chain key.
pub fn kdf_root(root_key: &RootKey, dh_output: &[u8; 32]) -> (RootKey, ChainKey) {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output);

    let mut output = Zeroizing::new([0u8; 64]);
    let Ok(()) = hkdf.expand(ROOT_LABEL, output.as_mut_slice()) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let root_key = RootKey::from_bytes(split(output.as_slice(), 0));
    let chain_key = ChainKey::from_bytes(split(output.as_slice(), 1));
    (root_key, chain_key)
}

fn split(output: &[u8], index: usize) -> [u8; 32] {
    let mut key = [0u8; 32];
    key.copy_from_slice(&output[index * 32..(index + 1) * 32]);
    key
}
