//! Pairwise session record.

use serde::{Deserialize, Serialize};
use tessera_crypto::{PublicKey, Role};

use crate::ratchet::RatchetState;

/// Everything this device keeps about its session with one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Side this device played in the handshake
    pub role: Role,
    /// Ephemeral key of the handshake that created the session
    pub handshake_ephemeral: PublicKey,
    /// Peer device the bundle belonged to (initiator only)
    pub peer_device_id: Option<String>,
    /// Responder prekey the handshake consumed
    pub used_pre_key_id: String,
    /// Double ratchet state
    pub ratchet: RatchetState,
    /// Responder session built from a competing handshake this session did
    /// not yield to. Held until the peer's next message shows which of the
    /// two it uses.
    #[serde(default)]
    pub pending: Option<Box<Session>>,
}

impl Session {
    /// Whether the peer is known to hold this session.
    ///
    /// A responder built the session from the peer's own handshake. An
    /// initiator knows once the peer has replied.
    pub fn is_confirmed(&self) -> bool {
        self.role == Role::Responder || self.ratchet.has_received()
    }

    /// Whether an incoming handshake with ephemeral key `incoming` should
    /// replace this session outright.
    ///
    /// A responder session yields to any other handshake: the peer started
    /// over. An initiator session yields only to a handshake whose ephemeral
    /// key sorts lower, confirmed or not. A crossing initiation from the
    /// peer always sorts higher than the session it lost to, even when it
    /// arrives after that session has been confirmed.
    pub fn yields_to(&self, incoming: &PublicKey) -> bool {
        if incoming == &self.handshake_ephemeral {
            return false;
        }
        self.role == Role::Responder || incoming < &self.handshake_ephemeral
    }

    /// Whether the handshake with ephemeral key `incoming` already built
    /// this session or its pending competitor.
    pub fn started_by(&self, incoming: &PublicKey) -> bool {
        incoming == &self.handshake_ephemeral
            || self.pending.as_ref().is_some_and(|pending| &pending.handshake_ephemeral == incoming)
    }

    /// Structural check applied when loading from storage.
    pub fn is_well_formed(&self) -> bool {
        let pending_ok = self.pending.as_ref().is_none_or(|pending| {
            pending.role == Role::Responder && pending.pending.is_none() && pending.is_well_formed()
        });
        !self.used_pre_key_id.is_empty() && self.ratchet.is_consistent() && pending_ok
    }
}
