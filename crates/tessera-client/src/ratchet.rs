//! Double ratchet.
//!
//! Each direction has a symmetric chain: every message key is derived from
//! the current chain key, which is then replaced. When a message arrives
//! under a ratchet key the receiver has not seen, both parties' chains are
//! re-keyed from a fresh DH output (the DH ratchet step).
//!
//! # Receive Algorithm
//!
//! ```text
//! cached (dh, n)? ─yes─► take it
//!      │ no
//!      ▼
//! recv_dh unset ──► adopt header.dh            (bootstrap)
//! recv_dh ≠ dh  ──► cache rest of old chain up to pn, DH ratchet
//!      │
//!      ▼
//! cache keys Nr..n-1, derive key n, Nr = n + 1
//! ```
//!
//! # Invariants
//!
//! - A message key is handed out at most once
//! - Counters only grow within a chain
//! - No more than `max_skip` keys are derived for one gap and no more than
//!   `max_cached` are held
//! - Without a receiving ratchet key, nothing has been received (`Nr == 0`,
//!   empty cache)

use std::collections::{HashMap, VecDeque};

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tessera_crypto::{ChainKey, DhKeyPair, MessageKey, PublicKey, RootKey, SessionKeys, kdf_root};
use tessera_proto::RatchetHeader;

use crate::SessionError;

/// Default limit on keys derived for a single gap.
pub const MAX_SKIP: u32 = 1000;

/// Default limit on cached skipped keys.
pub const MAX_SKIPPED_KEYS: usize = 2000;

/// Limits on out-of-order delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipPolicy {
    /// Keys that may be derived ahead for one message
    pub max_skip: u32,
    /// Cached keys kept before the oldest are evicted
    pub max_cached: usize,
}

impl Default for SkipPolicy {
    fn default() -> Self {
        Self { max_skip: MAX_SKIP, max_cached: MAX_SKIPPED_KEYS }
    }
}

/// Per-peer double ratchet state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: RootKey,
    send_chain_key: ChainKey,
    recv_chain_key: ChainKey,
    send_dh: DhKeyPair,
    recv_dh_public: Option<PublicKey>,
    /// Messages sent on the current sending chain
    ns: u32,
    /// Messages received on the current receiving chain
    nr: u32,
    /// Length of the previous sending chain
    pns: u32,
    skipped: SkippedKeys,
}

impl RatchetState {
    /// Initial state after a handshake.
    ///
    /// The responder passes the initiator's ratchet key from the first
    /// message header; the initiator learns the responder's from its reply.
    pub fn new(keys: SessionKeys, send_dh: DhKeyPair, recv_dh_public: Option<PublicKey>) -> Self {
        let SessionKeys { root_key, send_chain, recv_chain } = keys;
        Self {
            root_key,
            send_chain_key: send_chain,
            recv_chain_key: recv_chain,
            send_dh,
            recv_dh_public,
            ns: 0,
            nr: 0,
            pns: 0,
            skipped: SkippedKeys::default(),
        }
    }

    /// Messages sent on the current sending chain.
    pub fn send_count(&self) -> u32 {
        self.ns
    }

    /// Messages received on the current receiving chain.
    pub fn recv_count(&self) -> u32 {
        self.nr
    }

    /// Length of the previous sending chain.
    pub fn previous_send_count(&self) -> u32 {
        self.pns
    }

    /// Our current ratchet public key.
    pub fn send_dh_public(&self) -> PublicKey {
        self.send_dh.public_key()
    }

    /// Peer's current ratchet public key, once known.
    pub fn recv_dh_public(&self) -> Option<PublicKey> {
        self.recv_dh_public
    }

    /// Whether any message from the peer has been processed.
    pub fn has_received(&self) -> bool {
        self.recv_dh_public.is_some()
    }

    /// Number of cached skipped message keys.
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    /// Derive the key for the next outgoing message.
    ///
    /// # Errors
    ///
    /// - `CorruptRatchetState` if the sending counter is exhausted
    pub fn send(&mut self) -> Result<(RatchetHeader, MessageKey), SessionError> {
        let next_ns = self
            .ns
            .checked_add(1)
            .ok_or_else(|| SessionError::CorruptRatchetState("send counter overflow".into()))?;

        let (chain_key, message_key) = self.send_chain_key.step();
        let header =
            RatchetHeader { dh: self.send_dh.public_key().into(), pn: self.pns, n: self.ns };

        self.send_chain_key = chain_key;
        self.ns = next_ns;

        Ok((header, message_key))
    }

    /// Derive the key for an incoming message.
    ///
    /// On error the state may be partially advanced; callers ratchet a copy
    /// and keep it only once the message decrypts.
    ///
    /// # Errors
    ///
    /// - `TooManySkippedMessages` if the gap exceeds `policy.max_skip`
    /// - `MessageKeyUnavailable` if the counter was already consumed or its
    ///   key evicted
    /// - `CorruptRatchetState` if a counter overflows or the peer's ratchet
    ///   key is unusable
    pub fn receive<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        header: &RatchetHeader,
        policy: &SkipPolicy,
    ) -> Result<MessageKey, SessionError> {
        let dh = PublicKey::from(header.dh);

        if let Some(key) = self.skipped.take(&dh, header.n) {
            return Ok(key);
        }

        match self.recv_dh_public {
            None => {
                self.recv_dh_public = Some(dh);
                self.nr = 0;
            },
            Some(current) if current != dh => {
                self.skip_until(header.pn, policy)?;
                self.dh_ratchet(rng, dh)?;
            },
            Some(_) => {},
        }

        if header.n < self.nr {
            return Err(SessionError::MessageKeyUnavailable { counter: header.n });
        }
        self.skip_until(header.n, policy)?;

        let next_nr = self
            .nr
            .checked_add(1)
            .ok_or_else(|| SessionError::CorruptRatchetState("receive counter overflow".into()))?;
        let (chain_key, message_key) = self.recv_chain_key.step();
        self.recv_chain_key = chain_key;
        self.nr = next_nr;

        Ok(message_key)
    }

    /// Start a new sending chain against the peer's current ratchet key.
    ///
    /// This is the sending half of a DH ratchet step; the peer performs the
    /// matching receiving half when it sees the new key. Returns `false`
    /// without changing anything while the peer's key is unknown.
    pub fn rotate_send_chain<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<bool, SessionError> {
        let Some(peer) = self.recv_dh_public else {
            return Ok(false);
        };

        let send_dh = DhKeyPair::generate(rng);
        let shared = send_dh.diffie_hellman(&peer).map_err(corrupt_peer_key)?;
        let (root_key, send_chain_key) = kdf_root(&self.root_key, &shared);

        self.root_key = root_key;
        self.send_chain_key = send_chain_key;
        self.send_dh = send_dh;
        self.pns = self.ns;
        self.ns = 0;

        Ok(true)
    }

    /// Structural consistency check applied when loading from storage.
    pub fn is_consistent(&self) -> bool {
        if self.recv_dh_public.is_none() && (self.nr != 0 || !self.skipped.is_empty()) {
            return false;
        }
        self.skipped.is_consistent()
    }

    fn dh_ratchet<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        peer: PublicKey,
    ) -> Result<(), SessionError> {
        // Both DH outputs are computed before any field changes.
        let receive_shared = self.send_dh.diffie_hellman(&peer).map_err(invalid_peer_key)?;
        let send_dh = DhKeyPair::generate(rng);
        let send_shared = send_dh.diffie_hellman(&peer).map_err(invalid_peer_key)?;

        let (root_key, recv_chain_key) = kdf_root(&self.root_key, &receive_shared);
        let (root_key, send_chain_key) = kdf_root(&root_key, &send_shared);

        self.pns = self.ns;
        self.ns = 0;
        self.nr = 0;
        self.root_key = root_key;
        self.recv_chain_key = recv_chain_key;
        self.send_chain_key = send_chain_key;
        self.send_dh = send_dh;
        self.recv_dh_public = Some(peer);

        Ok(())
    }

    /// Cache receiving-chain keys for counters `Nr..until`.
    fn skip_until(&mut self, until: u32, policy: &SkipPolicy) -> Result<(), SessionError> {
        if until <= self.nr {
            return Ok(());
        }

        let requested = until - self.nr;
        if requested > policy.max_skip {
            return Err(SessionError::TooManySkippedMessages {
                requested,
                max: policy.max_skip,
            });
        }

        let Some(dh) = self.recv_dh_public else {
            return Err(SessionError::CorruptRatchetState("no receiving ratchet key".into()));
        };

        while self.nr < until {
            let (chain_key, message_key) = self.recv_chain_key.step();
            self.skipped.insert(dh, self.nr, message_key, policy.max_cached);
            self.recv_chain_key = chain_key;
            self.nr += 1;
        }

        Ok(())
    }
}

fn corrupt_peer_key(err: tessera_crypto::CryptoError) -> SessionError {
    SessionError::CorruptRatchetState(format!("unusable peer ratchet key: {err}"))
}

fn invalid_peer_key(err: tessera_crypto::CryptoError) -> SessionError {
    SessionError::InvalidRatchetKey(err.to_string())
}

/// Cached message keys for skipped counters, evicted oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<SkippedKey>", into = "Vec<SkippedKey>")]
struct SkippedKeys {
    keys: HashMap<(PublicKey, u32), MessageKey>,
    order: VecDeque<(PublicKey, u32)>,
}

impl SkippedKeys {
    fn len(&self) -> usize {
        self.keys.len()
    }

    fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn is_consistent(&self) -> bool {
        self.keys.len() == self.order.len()
    }

    fn insert(&mut self, dh: PublicKey, counter: u32, key: MessageKey, max_cached: usize) {
        if self.keys.insert((dh, counter), key).is_none() {
            self.order.push_back((dh, counter));
        }
        while self.keys.len() > max_cached {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.keys.remove(&oldest);
        }
    }

    fn take(&mut self, dh: &PublicKey, counter: u32) -> Option<MessageKey> {
        let key = self.keys.remove(&(*dh, counter))?;
        self.order.retain(|entry| entry != &(*dh, counter));
        Some(key)
    }
}

/// Persisted form of one cached key.
#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    dh: PublicKey,
    counter: u32,
    key: MessageKey,
}

impl From<Vec<SkippedKey>> for SkippedKeys {
    fn from(entries: Vec<SkippedKey>) -> Self {
        let mut skipped = Self::default();
        for SkippedKey { dh, counter, key } in entries {
            skipped.insert(dh, counter, key, usize::MAX);
        }
        skipped
    }
}

impl From<SkippedKeys> for Vec<SkippedKey> {
    fn from(skipped: SkippedKeys) -> Self {
        let SkippedKeys { mut keys, order } = skipped;
        order
            .into_iter()
            .filter_map(|(dh, counter)| {
                keys.remove(&(dh, counter)).map(|key| SkippedKey { dh, counter, key })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use tessera_crypto::{Role, derive_session_keys};
    use tessera_proto::PublicKeyBytes;

    use super::*;

    const SECRET: &[u8] = b"shared handshake secret used by ratchet tests";

    /// Initiator and responder states as the handshake leaves them.
    fn pair(rng: &mut ChaCha20Rng) -> (RatchetState, RatchetState) {
        let initiator = RatchetState::new(
            derive_session_keys(SECRET, Role::Initiator),
            DhKeyPair::generate(rng),
            None,
        );
        let responder = RatchetState::new(
            derive_session_keys(SECRET, Role::Responder),
            DhKeyPair::generate(rng),
            Some(initiator.send_dh_public()),
        );
        (initiator, responder)
    }

    #[test]
    fn in_order_keys_match() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let (mut alice, mut bob) = pair(&mut rng);
        let policy = SkipPolicy::default();

        for i in 0..5 {
            let (header, sent) = alice.send().unwrap();
            assert_eq!(header.n, i);
            let received = bob.receive(&mut rng, &header, &policy).unwrap();
            assert_eq!(sent, received);
        }
        assert_eq!(bob.recv_count(), 5);
        assert_eq!(bob.skipped_count(), 0);
    }

    #[test]
    fn reply_bootstraps_initiator() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let (mut alice, mut bob) = pair(&mut rng);
        let policy = SkipPolicy::default();

        let (header, _) = alice.send().unwrap();
        bob.receive(&mut rng, &header, &policy).unwrap();

        let (reply, sent) = bob.send().unwrap();
        assert!(!alice.has_received());
        let received = alice.receive(&mut rng, &reply, &policy).unwrap();

        assert_eq!(sent, received);
        assert_eq!(alice.recv_dh_public(), Some(bob.send_dh_public()));
    }

    #[test]
    fn out_of_order_uses_cache() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let (mut alice, mut bob) = pair(&mut rng);
        let policy = SkipPolicy::default();

        let messages: Vec<_> = (0..4).map(|_| alice.send().unwrap()).collect();

        let key3 = bob.receive(&mut rng, &messages[3].0, &policy).unwrap();
        assert_eq!(key3, messages[3].1);
        assert_eq!(bob.skipped_count(), 3);

        let key1 = bob.receive(&mut rng, &messages[1].0, &policy).unwrap();
        assert_eq!(key1, messages[1].1);
        assert_eq!(bob.skipped_count(), 2);
    }

    #[test]
    fn consumed_counter_is_unavailable() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let (mut alice, mut bob) = pair(&mut rng);
        let policy = SkipPolicy::default();

        let (header, _) = alice.send().unwrap();
        bob.receive(&mut rng, &header, &policy).unwrap();

        let result = bob.receive(&mut rng, &header, &policy);
        assert!(matches!(result, Err(SessionError::MessageKeyUnavailable { counter: 0 })));
    }

    #[test]
    fn gap_beyond_limit_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let (alice, mut bob) = pair(&mut rng);
        let policy = SkipPolicy { max_skip: 10, max_cached: 100 };

        let header = RatchetHeader { dh: alice.send_dh_public().into(), pn: 0, n: 11 };
        let result = bob.receive(&mut rng, &header, &policy);

        assert!(matches!(
            result,
            Err(SessionError::TooManySkippedMessages { requested: 11, max: 10 })
        ));
    }

    #[test]
    fn cache_evicts_oldest() {
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let (mut alice, mut bob) = pair(&mut rng);
        let policy = SkipPolicy { max_skip: 100, max_cached: 3 };

        let messages: Vec<_> = (0..6).map(|_| alice.send().unwrap()).collect();
        bob.receive(&mut rng, &messages[5].0, &policy).unwrap();

        assert_eq!(bob.skipped_count(), 3);
        assert!(matches!(
            bob.receive(&mut rng, &messages[0].0, &policy),
            Err(SessionError::MessageKeyUnavailable { counter: 0 })
        ));
        assert_eq!(bob.receive(&mut rng, &messages[4].0, &policy).unwrap(), messages[4].1);
    }

    #[test]
    fn dh_ratchet_rekeys_both_directions() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let (mut alice, mut bob) = pair(&mut rng);
        let policy = SkipPolicy::default();

        let (header, _) = alice.send().unwrap();
        bob.receive(&mut rng, &header, &policy).unwrap();
        let (reply, _) = bob.send().unwrap();
        alice.receive(&mut rng, &reply, &policy).unwrap();

        // Alice moves to a new ratchet key; Bob follows on receipt.
        assert!(alice.rotate_send_chain(&mut rng).unwrap());
        let (rotated, sent) = alice.send().unwrap();
        assert_eq!(rotated.pn, 1);
        assert_eq!(rotated.n, 0);

        let old_bob_key = bob.send_dh_public();
        assert_eq!(bob.receive(&mut rng, &rotated, &policy).unwrap(), sent);
        assert_ne!(bob.send_dh_public(), old_bob_key);

        // Bob's reply carries his new key; Alice ratchets to match.
        let (answer, sent) = bob.send().unwrap();
        assert_eq!(answer.pn, 1);
        assert_eq!(alice.receive(&mut rng, &answer, &policy).unwrap(), sent);
    }

    #[test]
    fn messages_from_previous_chain_are_cached_up_to_pn() {
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        let (mut alice, mut bob) = pair(&mut rng);
        let policy = SkipPolicy::default();

        let (first, _) = alice.send().unwrap();
        bob.receive(&mut rng, &first, &policy).unwrap();
        let (reply, _) = bob.send().unwrap();
        alice.receive(&mut rng, &reply, &policy).unwrap();

        // Two more on the old chain, delivered after the rotation.
        let late: Vec<_> = (0..2).map(|_| alice.send().unwrap()).collect();
        alice.rotate_send_chain(&mut rng).unwrap();
        let (rotated, sent) = alice.send().unwrap();
        assert_eq!(rotated.pn, 3);

        assert_eq!(bob.receive(&mut rng, &rotated, &policy).unwrap(), sent);
        assert_eq!(bob.skipped_count(), 2);
        for (header, key) in &late {
            assert_eq!(&bob.receive(&mut rng, header, &policy).unwrap(), key);
        }
    }

    #[test]
    fn low_order_header_key_is_rejected_without_advancing() {
        let mut rng = ChaCha20Rng::seed_from_u64(12);
        let (mut alice, mut bob) = pair(&mut rng);
        let policy = SkipPolicy::default();

        let (header, _) = alice.send().unwrap();
        bob.receive(&mut rng, &header, &policy).unwrap();

        let forged = RatchetHeader { dh: PublicKeyBytes::new([0; 32]), pn: 0, n: 0 };
        let mut attempt = bob.clone();
        let result = attempt.receive(&mut rng, &forged, &policy);
        assert!(matches!(result, Err(SessionError::InvalidRatchetKey(_))));
        assert!(!result.unwrap_err().discards_session());

        let (next, sent) = alice.send().unwrap();
        assert_eq!(bob.receive(&mut rng, &next, &policy).unwrap(), sent);
    }

    #[test]
    fn rotation_needs_peer_key() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let (mut alice, _) = pair(&mut rng);

        assert!(!alice.rotate_send_chain(&mut rng).unwrap());
        assert_eq!(alice.send_count(), 0);
    }

    #[test]
    fn state_survives_cbor() {
        let mut rng = ChaCha20Rng::seed_from_u64(10);
        let (mut alice, mut bob) = pair(&mut rng);
        let policy = SkipPolicy::default();

        let messages: Vec<_> = (0..3).map(|_| alice.send().unwrap()).collect();
        bob.receive(&mut rng, &messages[2].0, &policy).unwrap();

        let mut bytes = Vec::new();
        ciborium::into_writer(&bob, &mut bytes).unwrap();
        let mut restored: RatchetState = ciborium::from_reader(bytes.as_slice()).unwrap();

        assert!(restored.is_consistent());
        assert_eq!(restored.skipped_count(), 2);
        assert_eq!(restored.receive(&mut rng, &messages[0].0, &policy).unwrap(), messages[0].1);
    }

    #[test]
    fn received_counter_without_peer_key_is_inconsistent() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let (mut alice, _) = pair(&mut rng);
        alice.nr = 3;

        assert!(!alice.is_consistent());
    }
}
