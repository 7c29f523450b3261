//! Base64 encoding of binary wire fields

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use tessera_crypto::{PublicKey, Signature};

use crate::ProtocolError;

/// Serde adapter for fixed-size byte arrays as base64 strings.
pub(crate) mod base64_array {
    use super::{Deserialize, Deserializer, Serializer, decode_array};
    use serde::de::Error as _;

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        super::base64_vec::serialize(bytes, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        decode_array(&encoded).map_err(D::Error::custom)
    }
}

/// Serde adapter for variable-length bytes as base64 strings.
pub(crate) mod base64_vec {
    use super::{Deserialize, Deserializer, Engine, STANDARD, Serializer};
    use serde::de::Error as _;

    pub fn serialize<S: Serializer, T: AsRef<[u8]> + ?Sized>(
        bytes: &T,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

fn decode_array<const N: usize>(encoded: &str) -> Result<[u8; N], ProtocolError> {
    let decoded =
        STANDARD.decode(encoded.as_bytes()).map_err(|e| ProtocolError::Base64(e.to_string()))?;
    let actual = decoded.len();
    <[u8; N]>::try_from(decoded).map_err(|_| ProtocolError::InvalidLength { expected: N, actual })
}

/// 32-byte public key, base64 on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKeyBytes([u8; 32]);

impl PublicKeyBytes {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Standard base64 encoding.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Parse from standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self, ProtocolError> {
        decode_array(encoded).map(Self)
    }
}

impl fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_base64();
        write!(f, "PublicKeyBytes({}..)", &encoded[..8])
    }
}

impl Serialize for PublicKeyBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        base64_array::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKeyBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        base64_array::deserialize(deserializer).map(Self)
    }
}

impl From<PublicKey> for PublicKeyBytes {
    fn from(key: PublicKey) -> Self {
        Self(key.to_bytes())
    }
}

impl From<PublicKeyBytes> for PublicKey {
    fn from(key: PublicKeyBytes) -> Self {
        PublicKey::from_bytes(key.0)
    }
}

/// 64-byte Ed25519 signature, base64 on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Wrap raw signature bytes.
    pub fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SignatureBytes(..)")
    }
}

impl Serialize for SignatureBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        base64_array::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for SignatureBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        decode_array(&encoded).map(Self).map_err(D::Error::custom)
    }
}

impl From<Signature> for SignatureBytes {
    fn from(signature: Signature) -> Self {
        Self(*signature.as_bytes())
    }
}

impl From<SignatureBytes> for Signature {
    fn from(signature: SignatureBytes) -> Self {
        Signature::from_bytes(signature.0)
    }
}
