//! Tessera Cryptographic Primitives
//!
//! Building blocks for pairwise Tessera sessions. Everything here is a pure
//! function of its inputs; callers supply the random number generator so
//! tests can run deterministically.
//!
//! # Key Lifecycle
//!
//! ```text
//! X3DH: DH1 ‖ DH2 ‖ DH3 ‖ DH4
//!        │
//!        ▼
//! HKDF → root key, initiator→responder chain, responder→initiator chain
//!        │
//!        ├── DH ratchet step: KDF_root(root, DH(own, peer)) → (root', chain)
//!        ▼
//! Chain KDF (HMAC) → one message key per counter
//!        │
//!        ▼
//! ChaCha20-Poly1305(header as associated data) → ciphertext
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys are replaced after deriving each message key
//! - Message keys and chain keys are zeroized on drop
//!
//! Post-Compromise Security:
//! - Each DH ratchet step mixes a fresh X25519 output into the root key
//!
//! Authenticity:
//! - The AEAD tag covers the ratchet header through the associated data
//! - Signed prekeys are verified against the peer's Ed25519 identity key

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod chain;
mod error;
pub mod kdf;
pub mod keys;

pub use aead::{NONCE_SIZE, Sealed, TAG_SIZE, open, seal, seal_with_nonce};
pub use chain::{ChainKey, MessageKey, RootKey};
pub use error::CryptoError;
pub use kdf::{Role, SessionKeys, derive_session_keys, kdf_root};
pub use keys::{DhKeyPair, PublicKey, Signature, SigningKeyPair, verify_signature};
