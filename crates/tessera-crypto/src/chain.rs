//! Root, chain and message keys
//!
//! A chain key is stepped once per message. Each step yields the message key
//! for the current counter and replaces the chain key, so a captured chain
//! key reveals nothing about earlier messages.
//!
//! # Security Properties
//!
//! - Forward Secrecy: the old chain key is dropped (and zeroized) on step
//! - Key Uniqueness: each step produces a distinct message key
//! - Determinism: the same chain key always produces the same sequence

use std::fmt;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Wrap raw key bytes.
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Raw key bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.0.zeroize();
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "(..)"))
            }
        }
    };
}

secret_key! {
    /// Root key of a session. Replaced on every DH ratchet step.
    RootKey
}

secret_key! {
    /// Sending or receiving chain key.
    ChainKey
}

secret_key! {
    /// Single-use symmetric key for one message.
    MessageKey
}

impl ChainKey {
    /// Derive the message key for the current counter and the chain key
    /// for the next one.
    pub fn step(&self) -> (ChainKey, MessageKey) {
        let message_key = MessageKey(self.derive(MESSAGE_LABEL));
        let next = ChainKey(self.derive(CHAIN_LABEL));
        (next, message_key)
    }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.0) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }
}
