//! Cryptographic errors

use thiserror::Error;

/// Errors from key agreement, signatures and message encryption.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// AEAD tag did not verify: wrong key, tampered ciphertext, or tampered
    /// associated data.
    #[error("message authentication failed")]
    AuthenticationFailed,

    /// Ed25519 signature did not verify.
    #[error("signature verification failed")]
    InvalidSignature,

    /// Public key bytes are not a valid key.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// X25519 produced an all-zero output (low-order peer key).
    #[error("key agreement produced a non-contributory secret")]
    NonContributory,

    /// Byte string has the wrong length for the expected key type.
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required length
        expected: usize,
        /// Provided length
        actual: usize,
    },
}
