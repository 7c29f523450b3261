//! Tessera client
//!
//! Device-side half of Tessera: the device identity, the X3DH handshake,
//! the double ratchet, and the session bookkeeping that ties them to a key
//! directory and local storage.
//!
//! # Message Flow
//!
//! ```text
//! sender                                   receiver
//! ──────                                   ────────
//! no session? fetch bundle ─► initiate
//! ratchet.send() → (header, key)
//! seal(key, plaintext, header)  ─ envelope ─►  x3dh and no session? respond
//!                                              ratchet.receive(header) → key
//!                                              open(key, ciphertext, header)
//! ```
//!
//! # Components
//!
//! - [`DeviceIdentity`]: long-term keys and the one-time prekey inventory
//! - [`handshake`]: X3DH initiator and responder
//! - [`RatchetState`]: per-peer double ratchet with a bounded skip cache
//! - [`SessionStore`]: typed records over a [`KeyValueStore`]
//! - [`BundleDirectory`]: async seam to the key directory, over HTTP with
//!   [`HttpBundleDirectory`]
//! - [`SessionManager`]: one user's sessions with all peers

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod directory;
mod error;
pub mod handshake;
pub mod http;
pub mod identity;
mod manager;
pub mod ratchet;
mod session;
pub mod store;

pub use directory::{BundleDirectory, DirectoryError};
pub use error::SessionError;
pub use http::HttpBundleDirectory;
pub use identity::DeviceIdentity;
pub use manager::{SessionConfig, SessionManager};
pub use ratchet::{RatchetState, SkipPolicy};
pub use session::Session;
pub use store::{KeyValueStore, MemoryKeyValueStore, SessionStore, StoreError};
