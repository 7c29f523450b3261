//! Property tests for out-of-order and lossy delivery.

mod common;

use common::{key_directory, registered_pair};
use proptest::prelude::*;
use tessera_client::SessionError;
use tessera_proto::Envelope;

/// Alice's first message followed by `count` more, encrypted in order.
fn conversation(count: usize) -> (common::TestManager, Vec<(Envelope, Vec<u8>)>) {
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    runtime.block_on(async {
        let directory = key_directory();
        let (mut alice, mut bob) = registered_pair(&directory).await;

        let first = alice.encrypt_for_peer("bob", b"opening").await.unwrap();
        bob.decrypt_from_peer("alice", &first).unwrap();

        let mut messages = Vec::with_capacity(count);
        for i in 0..count {
            let plaintext = format!("message {i}").into_bytes();
            let envelope = alice.encrypt_for_peer("bob", &plaintext).await.unwrap();
            messages.push((envelope, plaintext));
        }
        (bob, messages)
    })
}

fn delivery_order() -> impl Strategy<Value = (Vec<usize>, Vec<bool>)> {
    (1usize..40).prop_flat_map(|count| {
        (
            Just((0..count).collect::<Vec<_>>()).prop_shuffle(),
            proptest::collection::vec(any::<bool>(), count),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: any permutation of messages within the skip window decrypts.
    #[test]
    fn prop_any_order_decrypts(order in delivery_order()) {
        let (indices, _) = order;
        let (mut bob, messages) = conversation(indices.len());

        for index in indices {
            let (envelope, plaintext) = &messages[index];
            prop_assert_eq!(&bob.decrypt_from_peer("alice", envelope).unwrap(), plaintext);
        }
    }

    /// Property: dropped messages never prevent later ones from decrypting,
    /// and a redelivered message is refused.
    #[test]
    fn prop_loss_and_duplicates(order in delivery_order()) {
        let (indices, dropped) = order;
        let (mut bob, messages) = conversation(indices.len());

        for index in indices {
            if dropped[index] {
                continue;
            }
            let (envelope, plaintext) = &messages[index];
            prop_assert_eq!(&bob.decrypt_from_peer("alice", envelope).unwrap(), plaintext);

            let again = bob.decrypt_from_peer("alice", envelope);
            let is_unavailable = matches!(again, Err(SessionError::MessageKeyUnavailable { .. }));
            prop_assert!(is_unavailable);
        }
    }
}
