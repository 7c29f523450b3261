//! Tessera wire types
//!
//! JSON schemas shared by the key directory service and its clients, and the
//! message envelope two devices exchange. Binary values are base64 strings
//! on the wire.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod bundle;
mod encoding;
pub mod envelope;
mod error;

pub use bundle::{
    DeviceReceipt, DeviceStatus, ErrorBody, OneTimePreKeyPublic, PreKeyBundle,
    PublishDeviceRequest, RevokeReceipt, SignedPreKeyPublic, TopUpRequest,
};
pub use encoding::{PublicKeyBytes, SignatureBytes};
pub use envelope::{Envelope, HandshakeMessage, RatchetHeader};
pub use error::ProtocolError;
