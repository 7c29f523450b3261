//! Property-based tests for envelope JSON encoding
//!
//! Envelopes cross the network as JSON. These properties hold for every
//! envelope shape, with and without the first-message handshake.

use proptest::prelude::*;
use tessera_proto::{Envelope, HandshakeMessage, ProtocolError, PublicKeyBytes, RatchetHeader};

fn arbitrary_key() -> impl Strategy<Value = PublicKeyBytes> {
    any::<[u8; 32]>().prop_map(PublicKeyBytes::new)
}

fn arbitrary_header() -> impl Strategy<Value = RatchetHeader> {
    (arbitrary_key(), any::<u32>(), any::<u32>())
        .prop_map(|(dh, pn, n)| RatchetHeader { dh, pn, n })
}

fn arbitrary_handshake() -> impl Strategy<Value = HandshakeMessage> {
    (arbitrary_key(), arbitrary_key(), "[a-f0-9-]{1,36}").prop_map(
        |(ephemeral_key, identity_key, used_pre_key_id)| HandshakeMessage {
            ephemeral_key,
            identity_key,
            used_pre_key_id,
        },
    )
}

fn arbitrary_envelope() -> impl Strategy<Value = Envelope> {
    (
        prop::collection::vec(any::<u8>(), 0..512), // ciphertext
        any::<[u8; 12]>(),
        prop::option::of(arbitrary_handshake()),
        arbitrary_header(),
    )
        .prop_map(|(ciphertext, nonce, x3dh, header)| Envelope { ciphertext, nonce, x3dh, header })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: Every envelope decodes to itself after JSON encoding
    #[test]
    fn prop_envelope_json_roundtrip(envelope in arbitrary_envelope()) {
        let bytes = envelope.to_json().unwrap();
        let decoded = Envelope::from_json(&bytes).unwrap();
        prop_assert_eq!(decoded, envelope);
    }

    /// Property: The handshake field is present on the wire exactly when the
    /// envelope carries one
    #[test]
    fn prop_handshake_presence_matches(envelope in arbitrary_envelope()) {
        let value: serde_json::Value =
            serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();
        prop_assert_eq!(value["handshake"].get("x3dh").is_some(), envelope.x3dh.is_some());
        prop_assert!(value["handshake"].get("ratchet").is_some());
    }

    /// Property: Removing the ratchet header is always reported as a
    /// malformed header, tagged with whether a handshake was attached
    #[test]
    fn prop_missing_header_is_reported(envelope in arbitrary_envelope()) {
        let mut value: serde_json::Value =
            serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();
        value["handshake"].as_object_mut().unwrap().remove("ratchet");
        let bytes = serde_json::to_vec(&value).unwrap();

        let has_handshake = envelope.x3dh.is_some();
        prop_assert_eq!(
            Envelope::from_json(&bytes),
            Err(ProtocolError::MalformedRatchetHeader { has_handshake })
        );
    }

    /// Property: Distinct headers never share associated data
    #[test]
    fn prop_associated_data_is_injective(a in arbitrary_header(), b in arbitrary_header()) {
        prop_assert_eq!(a == b, a.associated_data() == b.associated_data());
    }
}
