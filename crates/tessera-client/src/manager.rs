//! Per-user session orchestration.
//!
//! [`SessionManager`] ties the pieces together for one local user: it owns
//! the user's [`SessionStore`], reaches the key directory through an
//! injected [`BundleDirectory`], and draws randomness from an injected RNG.
//!
//! # Persistence Rules
//!
//! - A new identity is persisted before it is registered
//! - A sending session is persisted before its envelope is returned
//! - A receiving session (and a consumed prekey) is persisted only after
//!   the message decrypts, so a forged or replayed message never advances
//!   stored state
//! - Fresh one-time prekeys are persisted before they are uploaded
//!
//! All mutating methods take `&mut self`; share a manager between tasks
//! through `tokio::sync::Mutex` to keep a single writer per user.

use rand::{CryptoRng, RngCore, rngs::OsRng};
use tessera_crypto::{Role, open, seal};
use tessera_proto::{Envelope, HandshakeMessage, ProtocolError, TopUpRequest};

use crate::{
    SessionError,
    directory::{BundleDirectory, DirectoryError},
    handshake,
    identity::DeviceIdentity,
    ratchet::{RatchetState, SkipPolicy},
    session::Session,
    store::{KeyValueStore, SessionStore},
};

/// Client-side tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Out-of-order delivery limits
    pub skip: SkipPolicy,
    /// Top up when fewer unused one-time prekeys remain
    pub pre_key_low_watermark: usize,
    /// One-time prekeys generated per top-up
    pub pre_key_batch_size: usize,
    /// One-time prekeys generated with a new identity
    pub initial_pre_keys: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            skip: SkipPolicy::default(),
            pre_key_low_watermark: 5,
            pre_key_batch_size: 20,
            initial_pre_keys: 20,
        }
    }
}

/// Sessions of one local user with all of its peers.
pub struct SessionManager<K, D, R = OsRng>
where
    K: KeyValueStore,
    D: BundleDirectory,
    R: RngCore + CryptoRng,
{
    store: SessionStore<K>,
    directory: D,
    rng: R,
    config: SessionConfig,
}

impl<K: KeyValueStore, D: BundleDirectory> SessionManager<K, D, OsRng> {
    /// Manager for `user_id` drawing randomness from the operating system.
    pub fn new(user_id: impl Into<String>, kv: K, directory: D, config: SessionConfig) -> Self {
        Self::with_rng(user_id, kv, directory, config, OsRng)
    }
}

impl<K, D, R> SessionManager<K, D, R>
where
    K: KeyValueStore,
    D: BundleDirectory,
    R: RngCore + CryptoRng,
{
    /// Manager for `user_id` with a caller-supplied RNG.
    pub fn with_rng(
        user_id: impl Into<String>,
        kv: K,
        directory: D,
        config: SessionConfig,
        rng: R,
    ) -> Self {
        Self { store: SessionStore::new(kv, user_id), directory, rng, config }
    }

    /// Local user id.
    pub fn user_id(&self) -> &str {
        self.store.user_id()
    }

    /// Typed local storage of this user.
    pub fn store(&self) -> &SessionStore<K> {
        &self.store
    }

    /// Active configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Load or create this device's identity and make sure the directory
    /// holds it.
    ///
    /// Safe to call on every start: a device the directory already knows is
    /// treated as registered.
    pub async fn ensure_registered(&mut self) -> Result<DeviceIdentity, SessionError> {
        let mut identity = match self.store.load_identity()? {
            Some(identity) => identity,
            None => {
                let identity =
                    DeviceIdentity::generate(&mut self.rng, self.config.initial_pre_keys);
                self.store.save_identity(&identity)?;
                tracing::info!(
                    user_id = %self.store.user_id(),
                    device_id = %identity.device_id(),
                    "generated device identity"
                );
                identity
            },
        };

        if identity.is_registered() {
            return Ok(identity);
        }

        match self.directory.register_device(identity.registration()).await {
            Ok(receipt) => {
                tracing::info!(
                    user_id = %self.store.user_id(),
                    device_id = %receipt.device_id,
                    bundle_version = receipt.bundle_version,
                    one_time_pre_keys = receipt.one_time_pre_key_count,
                    "device registered"
                );
            },
            Err(DirectoryError::Conflict(_)) => {
                tracing::debug!(
                    user_id = %self.store.user_id(),
                    device_id = %identity.device_id(),
                    "device already registered"
                );
            },
            Err(err) => return Err(err.into()),
        }

        identity.mark_registered();
        self.store.save_identity(&identity)?;
        Ok(identity)
    }

    /// Encrypt `plaintext` for `peer`, starting a session if none exists.
    ///
    /// Starting a session consumes one of the peer's one-time prekeys and
    /// attaches the handshake to the returned envelope. Later envelopes
    /// carry only the ratchet header.
    pub async fn encrypt_for_peer(
        &mut self,
        peer: &str,
        plaintext: &[u8],
    ) -> Result<Envelope, SessionError> {
        if peer.is_empty() {
            return Err(SessionError::InvalidArgument("peer id is empty".into()));
        }

        let (mut session, x3dh) = match self.store.load_session(peer)? {
            Some(session) => (session, None),
            None => {
                let identity = self.store.load_identity()?.ok_or(SessionError::NotRegistered)?;
                let bundle = self.directory.fetch_bundle(peer).await?;
                let initiation = handshake::initiate(&mut self.rng, &identity, &bundle)?;

                tracing::info!(
                    user_id = %self.store.user_id(),
                    peer,
                    peer_device_id = %bundle.device_id,
                    bundle_version = bundle.bundle_version,
                    "session initiated"
                );

                let session = Session {
                    role: Role::Initiator,
                    handshake_ephemeral: initiation.ephemeral,
                    peer_device_id: Some(bundle.device_id),
                    used_pre_key_id: bundle.one_time_pre_key.key_id,
                    ratchet: initiation.ratchet,
                    pending: None,
                };
                (session, Some(initiation.handshake))
            },
        };

        let (header, message_key) = session.ratchet.send()?;
        let sealed = seal(&mut self.rng, &message_key, plaintext, &header.associated_data());
        self.store.save_session(peer, &session)?;

        Ok(Envelope { ciphertext: sealed.ciphertext, nonce: sealed.nonce, x3dh, header })
    }

    /// Decrypt an envelope from `peer`.
    ///
    /// An envelope carrying a handshake the current session did not come
    /// from builds a responder session. It replaces the current session when
    /// that session yields (see [`Session::yields_to`]); otherwise it is held
    /// as the pending competitor, and the peer's next message without a
    /// handshake decides which of the two survives. State changes are kept
    /// only if the message decrypts.
    ///
    /// # Errors
    ///
    /// - `NoSession` if there is no session and no handshake
    /// - `PreKeyNotFound` / `PreKeyAlreadyUsed` / `MalformedHandshake` if
    ///   the handshake cannot be completed
    /// - `AuthenticationFailed` if the ciphertext does not verify
    /// - `InvalidRatchetKey` if the header's ratchet key is unusable
    /// - `TooManySkippedMessages` / `MessageKeyUnavailable` for counters
    ///   outside the receivable window
    /// - `CorruptRatchetState` if the ratchet cannot continue; the session
    ///   has been discarded
    pub fn decrypt_from_peer(
        &mut self,
        peer: &str,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, SessionError> {
        let existing = self.store.load_session(peer)?;

        let result = match (&envelope.x3dh, existing) {
            (Some(x3dh), Some(session)) if session.started_by(&x3dh.ephemeral_key.into()) => {
                self.decrypt_with_session(peer, session, envelope)
            },
            (Some(x3dh), existing) => self.accept_handshake(peer, x3dh, existing, envelope),
            (None, Some(session)) => self.decrypt_with_session(peer, session, envelope),
            (None, None) => Err(SessionError::NoSession { peer: peer.to_owned() }),
        };

        match result {
            Err(err) if err.discards_session() => {
                self.discard_session(peer)?;
                Err(err)
            },
            other => other,
        }
    }

    /// Decrypt on the stored session, falling back to its pending
    /// competitor. Whichever opens the message becomes the session.
    fn decrypt_with_session(
        &mut self,
        peer: &str,
        mut session: Session,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, SessionError> {
        let mut ratchet = session.ratchet.clone();
        let err = match self.open_envelope(&mut ratchet, envelope) {
            Ok(plaintext) => {
                session.ratchet = ratchet;
                if session.pending.take().is_some() {
                    tracing::debug!(
                        user_id = %self.store.user_id(),
                        peer,
                        "peer kept the current session, dropping competitor"
                    );
                }
                self.store.save_session(peer, &session)?;
                return Ok(plaintext);
            },
            Err(err) => err,
        };

        let Some(mut pending) = session.pending.take() else {
            return Err(err);
        };
        let mut ratchet = pending.ratchet.clone();
        let Ok(plaintext) = self.open_envelope(&mut ratchet, envelope) else {
            return Err(err);
        };

        pending.ratchet = ratchet;
        tracing::info!(
            user_id = %self.store.user_id(),
            peer,
            used_pre_key_id = %pending.used_pre_key_id,
            "peer moved to the competing session, replacing"
        );
        self.store.save_session(peer, &pending)?;
        Ok(plaintext)
    }

    /// Complete the responder side of a handshake and decrypt its message.
    fn accept_handshake(
        &mut self,
        peer: &str,
        x3dh: &HandshakeMessage,
        existing: Option<Session>,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, SessionError> {
        let mut identity = self.store.load_identity()?.ok_or(SessionError::NotRegistered)?;
        let ratchet = handshake::respond(&mut self.rng, &mut identity, x3dh, &envelope.header)?;

        let mut candidate = Session {
            role: Role::Responder,
            handshake_ephemeral: x3dh.ephemeral_key.into(),
            peer_device_id: None,
            used_pre_key_id: x3dh.used_pre_key_id.clone(),
            ratchet,
            pending: None,
        };
        let plaintext = self.open_envelope(&mut candidate.ratchet, envelope)?;
        self.store.save_identity(&identity)?;

        let session = match existing {
            Some(mut current) if !current.yields_to(&candidate.handshake_ephemeral) => {
                tracing::info!(
                    user_id = %self.store.user_id(),
                    peer,
                    used_pre_key_id = %candidate.used_pre_key_id,
                    "holding competing handshake until the peer picks a session"
                );
                current.pending = Some(Box::new(candidate));
                current
            },
            Some(_) => {
                tracing::info!(
                    user_id = %self.store.user_id(),
                    peer,
                    "peer started a new session, replacing"
                );
                candidate
            },
            None => {
                tracing::info!(
                    user_id = %self.store.user_id(),
                    peer,
                    used_pre_key_id = %candidate.used_pre_key_id,
                    "session established as responder"
                );
                candidate
            },
        };

        self.store.save_session(peer, &session)?;
        Ok(plaintext)
    }

    /// Ratchet `ratchet` forward for `envelope` and open it. On error the
    /// ratchet may be partially advanced and must be thrown away.
    fn open_envelope(
        &mut self,
        ratchet: &mut RatchetState,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, SessionError> {
        let message_key = ratchet.receive(&mut self.rng, &envelope.header, &self.config.skip)?;
        let plaintext = open(
            &message_key,
            &envelope.ciphertext,
            &envelope.nonce,
            &envelope.header.associated_data(),
        )?;
        Ok(plaintext)
    }

    /// Decode a JSON envelope from `peer` and decrypt it.
    ///
    /// A missing or unreadable ratchet header is `MalformedHandshake` on a
    /// first message and `CorruptRatchetState` otherwise; in the latter case
    /// the session is discarded so the next exchange starts over.
    pub fn decrypt_payload(&mut self, peer: &str, payload: &[u8]) -> Result<Vec<u8>, SessionError> {
        let envelope = match Envelope::from_json(payload) {
            Ok(envelope) => envelope,
            Err(ProtocolError::MalformedRatchetHeader { has_handshake: true }) => {
                return Err(SessionError::MalformedHandshake("missing ratchet header".into()));
            },
            Err(ProtocolError::MalformedRatchetHeader { has_handshake: false }) => {
                self.discard_session(peer)?;
                return Err(SessionError::CorruptRatchetState("missing ratchet header".into()));
            },
            Err(err) => return Err(err.into()),
        };

        self.decrypt_from_peer(peer, &envelope)
    }

    /// Replenish one-time prekeys when the local supply runs low.
    ///
    /// Returns the number of keys uploaded (zero when the supply is
    /// sufficient).
    pub async fn ensure_prekeys_available(&mut self) -> Result<usize, SessionError> {
        let mut identity = self.store.load_identity()?.ok_or(SessionError::NotRegistered)?;
        if !identity.is_registered() {
            return Err(SessionError::NotRegistered);
        }

        let unused = identity.unused_pre_key_count();
        if unused >= self.config.pre_key_low_watermark {
            return Ok(0);
        }

        let keys = identity.generate_pre_keys(&mut self.rng, self.config.pre_key_batch_size);
        let uploaded = keys.len();
        self.store.save_identity(&identity)?;

        let receipt = self
            .directory
            .top_up(TopUpRequest {
                device_id: Some(identity.device_id().to_owned()),
                one_time_pre_keys: keys,
            })
            .await?;

        tracing::info!(
            user_id = %self.store.user_id(),
            device_id = %receipt.device_id,
            previously_unused = unused,
            uploaded,
            server_unused = receipt.one_time_pre_key_count,
            "one-time prekeys topped up"
        );

        Ok(uploaded)
    }

    /// Whether a session with `peer` is stored.
    pub fn has_session(&self, peer: &str) -> Result<bool, SessionError> {
        Ok(self.store.load_session(peer)?.is_some())
    }

    /// Drop the session with `peer`; the next send starts a new handshake.
    pub fn reset_session(&mut self, peer: &str) -> Result<(), SessionError> {
        self.discard_session(peer)
    }

    fn discard_session(&self, peer: &str) -> Result<(), SessionError> {
        tracing::warn!(user_id = %self.store.user_id(), peer, "discarding session");
        self.store.delete_session(peer)?;
        Ok(())
    }
}
