//! Fuzz target for RatchetState::receive
//!
//! Drives a sender/receiver ratchet pair through arbitrary delivery
//! schedules and forged headers.
//!
//! # Invariants
//!
//! - Receive never panics, whatever the header
//! - A genuine message opens at most once
//! - A forged header never opens a genuine ciphertext
//! - State is kept only when the message opens

#![no_main]

use std::collections::HashSet;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tessera_client::{RatchetState, SessionError, SkipPolicy};
use tessera_crypto::{derive_session_keys, open, seal_with_nonce, DhKeyPair, Role};
use tessera_proto::{PublicKeyBytes, RatchetHeader};

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    max_skip: u8,
    operations: Vec<Operation>,
}

#[derive(Debug, Arbitrary)]
enum Operation {
    /// Sender produces the next message
    Send,
    /// Deliver a previously sent message
    Deliver(u8),
    /// Deliver a header the sender never produced
    Forge { dh: [u8; 32], pn: u32, n: u32 },
    /// Sender starts a new chain
    Rotate,
    /// Receiver replies, letting the sender learn its ratchet key
    Reply,
}

fuzz_target!(|scenario: Scenario| {
    let mut rng = ChaCha20Rng::seed_from_u64(scenario.seed);
    let policy = SkipPolicy { max_skip: u32::from(scenario.max_skip), max_cached: 64 };

    let secret = [0x5A; 128];
    let mut sender = RatchetState::new(
        derive_session_keys(&secret, Role::Initiator),
        DhKeyPair::generate(&mut rng),
        None,
    );
    let mut receiver = RatchetState::new(
        derive_session_keys(&secret, Role::Responder),
        DhKeyPair::generate(&mut rng),
        Some(sender.send_dh_public()),
    );

    let mut sent: Vec<(RatchetHeader, Vec<u8>)> = Vec::new();
    let mut delivered = HashSet::new();

    for operation in scenario.operations.into_iter().take(256) {
        match operation {
            Operation::Send => {
                let Ok((header, key)) = sender.send() else { return };
                let sealed = seal_with_nonce(&key, [0; 12], b"payload", &header.associated_data());
                sent.push((header, sealed.ciphertext));
            },
            Operation::Deliver(index) => {
                let Some((header, ciphertext)) = sent.get(usize::from(index)).cloned() else {
                    continue;
                };
                let mut attempt = receiver.clone();
                match attempt.receive(&mut rng, &header, &policy) {
                    Ok(key) => {
                        let opened = open(&key, &ciphertext, &[0; 12], &header.associated_data());
                        if let Ok(plaintext) = opened {
                            assert!(delivered.insert(index), "message key handed out twice");
                            assert_eq!(plaintext, b"payload");
                            receiver = attempt;
                        }
                    },
                    Err(SessionError::MessageKeyUnavailable { .. })
                    | Err(SessionError::TooManySkippedMessages { .. })
                    | Err(SessionError::InvalidRatchetKey(_))
                    | Err(SessionError::CorruptRatchetState(_)) => {},
                    Err(other) => panic!("unexpected receive error: {other}"),
                }
            },
            Operation::Forge { dh, pn, n } => {
                let header = RatchetHeader { dh: PublicKeyBytes::new(dh), pn, n };
                let mut attempt = receiver.clone();
                if let Ok(key) = attempt.receive(&mut rng, &header, &policy) {
                    for (genuine, ciphertext) in &sent {
                        if genuine == &header {
                            continue;
                        }
                        let opened = open(&key, ciphertext, &[0; 12], &header.associated_data());
                        assert!(opened.is_err(), "forged header opened a genuine message");
                    }
                }
            },
            Operation::Rotate => {
                let _ = sender.rotate_send_chain(&mut rng);
            },
            Operation::Reply => {
                let Ok((header, _)) = receiver.send() else { return };
                let mut attempt = sender.clone();
                if attempt.receive(&mut rng, &header, &policy).is_ok() {
                    sender = attempt;
                }
            },
        }
    }
});
