//! Message encryption using `ChaCha20-Poly1305`
//!
//! Every message key is used for exactly one seal. The ratchet header is
//! passed as associated data so any change to it fails authentication.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{CryptoRng, RngCore};

use crate::{CryptoError, MessageKey};

/// Nonce size (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Ciphertext and the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Ciphertext including the 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
    /// Random nonce
    pub nonce: [u8; NONCE_SIZE],
}

impl Sealed {
    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(TAG_SIZE)
    }
}

/// Seal `plaintext` under a fresh random nonce.
pub fn seal<R: RngCore + CryptoRng>(
    rng: &mut R,
    message_key: &MessageKey,
    plaintext: &[u8],
    associated_data: &[u8],
) -> Sealed {
    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);
    seal_with_nonce(message_key, nonce, plaintext, associated_data)
}

/// Seal `plaintext` under a caller-chosen nonce.
///
/// The caller must never reuse a nonce with the same key.
pub fn seal_with_nonce(
    message_key: &MessageKey,
    nonce: [u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Sealed {
    let cipher = ChaCha20Poly1305::new(message_key.as_bytes().into());
    let payload = Payload { msg: plaintext, aad: associated_data };

    let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(&nonce), payload) else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    Sealed { ciphertext, nonce }
}

/// Open a sealed message.
///
/// # Errors
///
/// - `AuthenticationFailed`: wrong key, or ciphertext, nonce or associated
///   data were modified
pub fn open(
    message_key: &MessageKey,
    ciphertext: &[u8],
    nonce: &[u8; NONCE_SIZE],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(message_key.as_bytes().into());
    let payload = Payload { msg: ciphertext, aad: associated_data };

    cipher.decrypt(Nonce::from_slice(nonce), payload).map_err(|_| CryptoError::AuthenticationFailed)
}
