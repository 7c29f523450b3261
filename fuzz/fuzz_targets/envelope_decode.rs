//! Fuzz target for Envelope::from_json
//!
//! Feeds arbitrary bytes to the envelope decoder:
//! - Malformed JSON and wrong field types
//! - Invalid base64 and wrong key/nonce lengths
//! - Missing or garbage ratchet headers with and without a handshake
//!
//! The decoder should NEVER panic. Anything it accepts must survive a
//! re-encode unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera_proto::Envelope;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = Envelope::from_json(data) else {
        return;
    };

    let encoded = envelope.to_json().expect("decoded envelope must re-encode");
    let decoded = Envelope::from_json(&encoded).expect("re-encoded envelope must decode");
    assert_eq!(decoded, envelope);
});
