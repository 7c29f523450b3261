//! Wire decoding errors

use thiserror::Error;

/// Errors decoding wire payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload is not valid JSON for the expected shape.
    #[error("malformed payload: {0}")]
    Json(String),

    /// A binary field is not valid base64.
    #[error("invalid base64: {0}")]
    Base64(String),

    /// A binary field decoded to the wrong length.
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required length
        expected: usize,
        /// Decoded length
        actual: usize,
    },

    /// Envelope ratchet header is absent or unreadable.
    #[error("missing or malformed ratchet header")]
    MalformedRatchetHeader {
        /// Whether the envelope also carried a handshake
        has_handshake: bool,
    },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
