//! Message envelope
//!
//! ```json
//! {
//!   "ciphertext": "<b64>",
//!   "nonce": "<b64, 12 bytes>",
//!   "handshake": {
//!     "x3dh": { "ephPubKey": "<b64>", "identityKey": "<b64>", "usedPreKeyId": "<id>" },
//!     "ratchet": { "dh": "<b64>", "pn": 0, "n": 0 }
//!   }
//! }
//! ```
//!
//! `x3dh` is present only on the first message of a session. The ratchet
//! header is always present and is authenticated as AEAD associated data.

use serde::{Deserialize, Serialize, de::IgnoredAny};

use crate::{ProtocolError, PublicKeyBytes, encoding::base64_vec};

/// AEAD nonce length.
pub const NONCE_SIZE: usize = 12;

/// Size of [`RatchetHeader::associated_data`].
pub const HEADER_AD_SIZE: usize = 40;

/// Handshake fields the initiator attaches to its first message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Initiator's ephemeral X25519 key
    #[serde(rename = "ephPubKey")]
    pub ephemeral_key: PublicKeyBytes,
    /// Initiator's identity X25519 key
    #[serde(rename = "identityKey")]
    pub identity_key: PublicKeyBytes,
    /// Responder's one-time prekey the initiator consumed
    #[serde(rename = "usedPreKeyId")]
    pub used_pre_key_id: String,
}

/// Double-ratchet message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key
    pub dh: PublicKeyBytes,
    /// Length of the sender's previous sending chain
    pub pn: u32,
    /// Message counter in the current sending chain
    pub n: u32,
}

impl RatchetHeader {
    /// Canonical header bytes bound into the AEAD tag:
    /// `dh (32) ‖ pn (u32 BE) ‖ n (u32 BE)`.
    pub fn associated_data(&self) -> [u8; HEADER_AD_SIZE] {
        let mut out = [0u8; HEADER_AD_SIZE];
        out[0..32].copy_from_slice(self.dh.as_bytes());
        out[32..36].copy_from_slice(&self.pn.to_be_bytes());
        out[36..40].copy_from_slice(&self.n.to_be_bytes());
        out
    }
}

/// Encrypted message as exchanged between devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// AEAD ciphertext including tag
    pub ciphertext: Vec<u8>,
    /// AEAD nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Handshake, on the first message of a session only
    pub x3dh: Option<HandshakeMessage>,
    /// Ratchet header
    pub header: RatchetHeader,
}

impl Envelope {
    /// Encode as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(&OutgoingEnvelope::from(self))?)
    }

    /// Decode from JSON.
    ///
    /// A missing or unreadable ratchet header is reported as
    /// [`ProtocolError::MalformedRatchetHeader`] rather than a generic
    /// decode error, so the receiver can tell it apart from transport noise.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let incoming: IncomingEnvelope = serde_json::from_slice(bytes)?;
        Self::try_from(incoming)
    }
}

impl Serialize for Envelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        OutgoingEnvelope::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let incoming = IncomingEnvelope::deserialize(deserializer)?;
        Self::try_from(incoming).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    #[serde(with = "base64_vec")]
    ciphertext: &'a [u8],
    #[serde(with = "base64_vec")]
    nonce: &'a [u8; NONCE_SIZE],
    handshake: OutgoingHandshake<'a>,
}

#[derive(Serialize)]
struct OutgoingHandshake<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    x3dh: Option<&'a HandshakeMessage>,
    ratchet: &'a RatchetHeader,
}

impl<'a> From<&'a Envelope> for OutgoingEnvelope<'a> {
    fn from(envelope: &'a Envelope) -> Self {
        Self {
            ciphertext: &envelope.ciphertext,
            nonce: &envelope.nonce,
            handshake: OutgoingHandshake {
                x3dh: envelope.x3dh.as_ref(),
                ratchet: &envelope.header,
            },
        }
    }
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    #[serde(with = "base64_vec")]
    ciphertext: Vec<u8>,
    #[serde(with = "base64_vec")]
    nonce: Vec<u8>,
    #[serde(default)]
    handshake: Option<IncomingHandshake>,
}

#[derive(Deserialize)]
struct IncomingHandshake {
    #[serde(default)]
    x3dh: Option<HandshakeMessage>,
    #[serde(default)]
    ratchet: Option<IncomingHeader>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IncomingHeader {
    Valid(RatchetHeader),
    Malformed(IgnoredAny),
}

impl TryFrom<IncomingEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(incoming: IncomingEnvelope) -> Result<Self, Self::Error> {
        let actual = incoming.nonce.len();
        let nonce = <[u8; NONCE_SIZE]>::try_from(incoming.nonce)
            .map_err(|_| ProtocolError::InvalidLength { expected: NONCE_SIZE, actual })?;

        let (x3dh, ratchet) = match incoming.handshake {
            Some(handshake) => (handshake.x3dh, handshake.ratchet),
            None => (None, None),
        };

        let header = match ratchet {
            Some(IncomingHeader::Valid(header)) => header,
            Some(IncomingHeader::Malformed(_)) | None => {
                return Err(ProtocolError::MalformedRatchetHeader { has_handshake: x3dh.is_some() });
            },
        };

        Ok(Self { ciphertext: incoming.ciphertext, nonce, x3dh, header })
    }
}
