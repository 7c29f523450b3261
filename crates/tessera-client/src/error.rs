//! Session error types

use tessera_crypto::CryptoError;
use tessera_proto::ProtocolError;
use thiserror::Error;

use crate::{directory::DirectoryError, store::StoreError};

/// Errors from establishing or using a pairwise session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Caller supplied an invalid value. Not retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Directory already holds an active record for this device.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Peer has no active bundle with an unused prekey.
    #[error("not found: {0}")]
    NotFound(String),

    /// Handshake names a one-time prekey this device does not hold.
    #[error("one-time prekey {key_id} not found")]
    PreKeyNotFound {
        /// Key id named by the handshake
        key_id: String,
    },

    /// Handshake names a one-time prekey that was already consumed.
    #[error("one-time prekey {key_id} already used")]
    PreKeyAlreadyUsed {
        /// Key id named by the handshake
        key_id: String,
    },

    /// Handshake fields are missing or unusable.
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    /// Ratchet state cannot be used; the session must be rebuilt.
    #[error("corrupt ratchet state: {0}")]
    CorruptRatchetState(String),

    /// Message header carries a ratchet key no DH can be computed with.
    /// The message is rejected and the session is unchanged.
    #[error("invalid ratchet key: {0}")]
    InvalidRatchetKey(String),

    /// AEAD tag did not verify. The session is unchanged.
    #[error("message authentication failed")]
    AuthenticationFailed,

    /// Message is further ahead than the skip limit allows.
    #[error("too many skipped messages: {requested} > {max}")]
    TooManySkippedMessages {
        /// Keys that would have to be derived
        requested: u32,
        /// Configured limit
        max: u32,
    },

    /// Message key was already used or evicted.
    #[error("message key unavailable for counter {counter}")]
    MessageKeyUnavailable {
        /// Counter of the rejected message
        counter: u32,
    },

    /// Signed prekey signature did not verify under the bundle's signing key.
    #[error("invalid signed prekey signature")]
    InvalidBundleSignature,

    /// No session with the peer and the message carries no handshake.
    #[error("no session with {peer}")]
    NoSession {
        /// Peer user id
        peer: String,
    },

    /// Local device identity has not been created yet.
    #[error("device not registered")]
    NotRegistered,

    /// Envelope could not be decoded.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] ProtocolError),

    /// Primitive failure outside the handshake.
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Directory could not be reached. Retryable.
    #[error("directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// Local persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl SessionError {
    /// Whether the operation may succeed if retried later with the same
    /// inputs.
    ///
    /// Cryptographic failures are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::DirectoryUnavailable(_) => true,
            Self::Storage(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Whether the stored session for the peer has been discarded.
    pub fn discards_session(&self) -> bool {
        matches!(self, Self::CorruptRatchetState(_))
    }
}

impl From<CryptoError> for SessionError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => Self::AuthenticationFailed,
            CryptoError::InvalidSignature => Self::InvalidBundleSignature,
            other => Self::Crypto(other),
        }
    }
}

impl From<DirectoryError> for SessionError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            DirectoryError::Conflict(msg) => Self::Conflict(msg),
            DirectoryError::NotFound(msg) => Self::NotFound(msg),
            DirectoryError::Unavailable(msg) => Self::DirectoryUnavailable(msg),
        }
    }
}
