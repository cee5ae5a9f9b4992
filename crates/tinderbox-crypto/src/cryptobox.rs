//! Session orchestration for one local identity.
//!
//! A session id moves `Absent → Handshaking → Active → Deleted`. Handshakes
//! are persisted before any prekey they consumed is deleted, and sessions
//! only enter the cache once they are durable.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::config::CryptoboxConfig;
use crate::engine::{ProtocolEngine, X3dhEngine};
use crate::error::{CryptoboxError, Payload, StoreError};
use crate::events::{CryptoboxEvent, EventPublisher};
use crate::lru::LruCache;
use crate::pool::PreKeyPool;
use crate::prekey::{PreKey, PreKeyId, SerializedPreKey};
use crate::session::{CryptoboxSession, SessionCache};
use crate::store::CryptoboxStore;
use crate::tracker::{ConsumptionTracker, TrackedPreKeys};

/// How [`Cryptobox::resolve`] obtained a session.
#[derive(Debug)]
pub enum Resolution<T> {
    /// Found in the cache or in storage.
    Existing(CryptoboxSession<T>),
    /// Created from a peer's prekey bundle.
    Initiated(CryptoboxSession<T>),
    /// Created from a peer's first message, which decrypted to `plaintext`.
    Accepted {
        session: CryptoboxSession<T>,
        plaintext: Vec<u8>,
    },
}

impl<T> Resolution<T> {
    pub fn session(&self) -> &CryptoboxSession<T> {
        match self {
            Self::Existing(session) | Self::Initiated(session) => session,
            Self::Accepted { session, .. } => session,
        }
    }

    pub fn into_session(self) -> CryptoboxSession<T> {
        match self {
            Self::Existing(session) | Self::Initiated(session) => session,
            Self::Accepted { session, .. } => session,
        }
    }
}

/// Prekeys, sessions and the local identity on top of a durable store.
pub struct Cryptobox<S, E: ProtocolEngine = X3dhEngine> {
    store: S,
    engine: E,
    config: CryptoboxConfig,
    identity: E::Identity,
    pool: PreKeyPool,
    tracker: ConsumptionTracker,
    prekey_cache: Mutex<LruCache<PreKeyId, PreKey>>,
    sessions: SessionCache<E::Session>,
    events: EventPublisher,
}

impl<S: CryptoboxStore, E: ProtocolEngine> Cryptobox<S, E> {
    fn assemble(store: S, engine: E, config: CryptoboxConfig, identity: E::Identity) -> Self {
        Self {
            prekey_cache: Mutex::new(LruCache::new(config.prekey_cache_capacity)),
            sessions: SessionCache::new(config.session_cache_capacity),
            store,
            engine,
            config,
            identity,
            pool: PreKeyPool::new(),
            tracker: ConsumptionTracker::new(),
            events: EventPublisher::new(),
        }
    }

    /// Create a fresh identity in `store` together with its last-resort
    /// prekey and an initial batch of standard prekeys.
    pub async fn create(store: S, engine: E, config: CryptoboxConfig) -> Result<Self, CryptoboxError> {
        let identity = engine.new_identity();
        let bytes = engine.serialize_identity(&identity)?;
        store.save_identity(&bytes).await?;

        let cryptobox = Self::assemble(store, engine, config, identity);
        let last_resort = cryptobox
            .pool
            .create_last_resort(&cryptobox.engine, &cryptobox.store)
            .await?;
        cryptobox.prekey_cache.lock().set(last_resort.id, last_resort);
        cryptobox.refill_prekeys().await?;

        tracing::info!(fingerprint = %cryptobox.local_fingerprint(), "created cryptobox identity");
        Ok(cryptobox)
    }

    /// Load an existing identity and its prekeys from `store`.
    ///
    /// Fails with [`CryptoboxError::IdentityMissing`] or
    /// [`CryptoboxError::LastResortMissing`] instead of regenerating anything.
    pub async fn load(store: S, engine: E, config: CryptoboxConfig) -> Result<Self, CryptoboxError> {
        let bytes = store
            .load_identity()
            .await?
            .ok_or(CryptoboxError::IdentityMissing)?;
        let identity = engine
            .deserialize_identity(&bytes)
            .map_err(|e| CryptoboxError::CorruptRecord {
                kind: "identity",
                reason: e.to_string(),
            })?;

        let prekeys = store
            .load_prekeys()
            .await?
            .iter()
            .map(|stored| {
                PreKey::from_bytes(&stored.record).map_err(|e| CryptoboxError::CorruptRecord {
                    kind: "prekey",
                    reason: format!("{}: {e}", stored.id),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cryptobox = Self::assemble(store, engine, config, identity);
        cryptobox.pool.seed(prekeys);
        let last_resort = cryptobox
            .pool
            .last_resort()
            .ok_or(CryptoboxError::LastResortMissing)?;
        cryptobox.prekey_cache.lock().set(last_resort.id, last_resort);
        cryptobox.refill_prekeys().await?;

        tracing::info!(
            fingerprint = %cryptobox.local_fingerprint(),
            prekeys = cryptobox.pool.len(),
            "loaded cryptobox identity"
        );
        Ok(cryptobox)
    }

    /// Load the identity in `store`, or create one if there is none.
    pub async fn open(store: S, engine: E, config: CryptoboxConfig) -> Result<Self, CryptoboxError> {
        if store.load_identity().await?.is_some() {
            Self::load(store, engine, config).await
        } else {
            Self::create(store, engine, config).await
        }
    }

    pub fn identity(&self) -> &E::Identity {
        &self.identity
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Drop the in-memory state and hand the store back.
    pub fn into_store(self) -> S {
        self.store
    }

    pub fn config(&self) -> &CryptoboxConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CryptoboxEvent> {
        self.events.subscribe()
    }

    pub fn local_fingerprint(&self) -> String {
        self.engine.identity_fingerprint(&self.identity)
    }

    /// Fingerprint of the peer on the other end of `session_id`.
    pub async fn remote_fingerprint(&self, session_id: &str) -> Result<String, CryptoboxError> {
        let session = self.session_load(session_id).await?;
        Ok(self.engine.session_fingerprint(&session.state))
    }

    /// Standard prekey IDs currently in the pool, in ID order.
    pub fn standard_prekey_ids(&self) -> Vec<PreKeyId> {
        self.pool.standard_ids()
    }

    /// Prekey IDs consumed by a handshake but not yet deleted from storage.
    pub fn pending_prekey_ids(&self) -> Vec<PreKeyId> {
        self.tracker.pending_ids()
    }

    /// The public bundle for prekey `id`.
    pub fn prekey_bundle(&self, id: PreKeyId) -> Result<Vec<u8>, CryptoboxError> {
        if self.tracker.is_removed(id) {
            return Err(CryptoboxError::PreKeyNotFound(id));
        }
        let prekey = self.pool.get(id).ok_or(CryptoboxError::PreKeyNotFound(id))?;
        Ok(self.engine.prekey_bundle(&self.identity, &prekey)?)
    }

    pub fn serialize_prekey(&self, prekey: &PreKey) -> Result<SerializedPreKey, CryptoboxError> {
        let bundle = self.engine.prekey_bundle(&self.identity, prekey)?;
        Ok(SerializedPreKey {
            id: prekey.id,
            key: BASE64.encode(bundle),
        })
    }

    pub fn serialized_last_resort_prekey(&self) -> Result<SerializedPreKey, CryptoboxError> {
        let last_resort = self
            .pool
            .last_resort()
            .ok_or(CryptoboxError::LastResortMissing)?;
        self.serialize_prekey(&last_resort)
    }

    /// Every standard prekey still available to peers.
    pub fn serialized_standard_prekeys(&self) -> Result<Vec<SerializedPreKey>, CryptoboxError> {
        self.pool
            .standard_prekeys()
            .iter()
            .filter(|prekey| !self.tracker.is_removed(prekey.id))
            .map(|prekey| self.serialize_prekey(prekey))
            .collect()
    }

    /// Top the prekey pool up to the configured minimum.
    ///
    /// Publishes [`CryptoboxEvent::NewPreKeys`] when anything was created.
    pub async fn refill_prekeys(&self) -> Result<Vec<PreKey>, CryptoboxError> {
        let created = self
            .pool
            .ensure_minimum(
                self.config.minimum_prekeys(),
                &self.engine,
                &self.store,
                &self.tracker,
            )
            .await?;
        if !created.is_empty() {
            let serialized = created
                .iter()
                .map(|prekey| self.serialize_prekey(prekey))
                .collect::<Result<Vec<_>, _>>()?;
            self.events.publish(CryptoboxEvent::NewPreKeys(serialized));
        }
        Ok(created)
    }

    /// Look up a session in the cache, then in storage.
    pub async fn session_load(
        &self,
        session_id: &str,
    ) -> Result<CryptoboxSession<E::Session>, CryptoboxError> {
        if let Some(session) = self.sessions.get(session_id) {
            return Ok(session);
        }

        let bytes = match self.store.read_session(session_id).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => {
                return Err(CryptoboxError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let state = self
            .engine
            .deserialize_session(&self.identity, &bytes)
            .map_err(|e| CryptoboxError::CorruptRecord {
                kind: "session",
                reason: e.to_string(),
            })?;

        let session = CryptoboxSession::new(session_id, state);
        self.sessions.put(session.clone());
        Ok(session)
    }

    /// Start a session with the peer who published `bundle`.
    ///
    /// If another handshake persisted `session_id` first, that session wins
    /// and is returned instead of the one derived here.
    pub async fn session_from_prekey(
        &self,
        session_id: &str,
        bundle: &[u8],
    ) -> Result<CryptoboxSession<E::Session>, CryptoboxError> {
        let bundle = self
            .engine
            .deserialize_bundle(bundle)
            .map_err(|e| CryptoboxError::InvalidPreKeyFormat(e.to_string()))?;
        let state = self.engine.init_session_from_bundle(&self.identity, &bundle)?;
        let bytes = self.engine.serialize_session(&state)?;

        match self.store.create_session(session_id, &bytes).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                tracing::debug!(session = %session_id, "session created concurrently, using stored one");
                return self.session_load(session_id).await;
            }
            Err(e) => return Err(e.into()),
        }

        let session = CryptoboxSession::new(session_id, state);
        self.sessions.put(session.clone());
        tracing::info!(session = %session_id, "initiated session");
        Ok(session)
    }

    /// Accept a session from a peer's first message and return its plaintext.
    pub async fn session_from_message(
        &self,
        session_id: &str,
        envelope: &[u8],
    ) -> Result<(CryptoboxSession<E::Session>, Vec<u8>), CryptoboxError> {
        let prekeys = TrackedPreKeys::new(&self.tracker, &self.prekey_cache, &self.store);
        let (state, plaintext) = self
            .engine
            .init_session_from_envelope(&self.identity, &prekeys, envelope)
            .await?;
        let bytes = self.engine.serialize_session(&state)?;

        if let Err(source) = self.store.create_session(session_id, &bytes).await {
            tracing::warn!(session = %session_id, error = %source, "accepted session could not be saved");
            return Err(CryptoboxError::UnsavedSession {
                session_id: session_id.to_string(),
                output: Payload(plaintext),
                source,
            });
        }
        tracing::info!(session = %session_id, "accepted session");
        self.events
            .publish(CryptoboxEvent::NewSession(session_id.to_string()));

        let session = CryptoboxSession::new(session_id, state);
        self.cleanup(session.clone()).await;
        Ok((session, plaintext))
    }

    /// Find or establish `session_id`.
    ///
    /// Existing sessions win. Otherwise a `bundle` starts a session as the
    /// initiator and an `envelope` accepts one as the responder. With
    /// neither, fails with [`CryptoboxError::SessionNotFound`].
    pub async fn resolve(
        &self,
        session_id: &str,
        bundle: Option<&[u8]>,
        envelope: Option<&[u8]>,
    ) -> Result<Resolution<E::Session>, CryptoboxError> {
        match self.session_load(session_id).await {
            Ok(session) => return Ok(Resolution::Existing(session)),
            Err(CryptoboxError::SessionNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        match (bundle, envelope) {
            (Some(bundle), _) => self
                .session_from_prekey(session_id, bundle)
                .await
                .map(Resolution::Initiated),
            (None, Some(envelope)) => {
                let (session, plaintext) = self.session_from_message(session_id, envelope).await?;
                Ok(Resolution::Accepted { session, plaintext })
            }
            (None, None) => Err(CryptoboxError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Encrypt `plaintext` for an established session.
    ///
    /// If the advanced session cannot be saved the error carries the
    /// ciphertext.
    pub async fn encrypt(&self, session_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoboxError> {
        let mut session = self.session_load(session_id).await?;
        let ciphertext = self.engine.encrypt(&mut session.state, plaintext)?;
        let bytes = self.engine.serialize_session(&session.state)?;

        if let Err(source) = self.store.update_session(session_id, &bytes).await {
            tracing::warn!(session = %session_id, error = %source, "session could not be saved after encrypt");
            return Err(CryptoboxError::UnsavedSession {
                session_id: session_id.to_string(),
                output: Payload(ciphertext),
                source,
            });
        }

        self.cleanup(session).await;
        Ok(ciphertext)
    }

    /// Decrypt `ciphertext`, accepting a new session if none exists yet.
    pub async fn decrypt(&self, session_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoboxError> {
        if ciphertext.is_empty() {
            return Err(CryptoboxError::EmptyCiphertext);
        }

        let mut session = match self.session_load(session_id).await {
            Ok(session) => session,
            Err(CryptoboxError::SessionNotFound(_)) => {
                tracing::debug!(session = %session_id, "no session, treating message as handshake");
                let (_, plaintext) = self.session_from_message(session_id, ciphertext).await?;
                return Ok(plaintext);
            }
            Err(e) => return Err(e),
        };

        let prekeys = TrackedPreKeys::new(&self.tracker, &self.prekey_cache, &self.store);
        let plaintext = self
            .engine
            .decrypt(&self.identity, &mut session.state, &prekeys, ciphertext)
            .await?;
        let bytes = self.engine.serialize_session(&session.state)?;

        if let Err(source) = self.store.update_session(session_id, &bytes).await {
            tracing::warn!(session = %session_id, error = %source, "session could not be saved after decrypt");
            return Err(CryptoboxError::UnsavedSession {
                session_id: session_id.to_string(),
                output: Payload(plaintext),
                source,
            });
        }

        self.cleanup(session).await;
        Ok(plaintext)
    }

    /// Forget `session_id` in the cache and in storage. Idempotent.
    pub async fn session_delete(&self, session_id: &str) -> Result<(), CryptoboxError> {
        self.sessions.invalidate(session_id);
        match self.store.delete_session(session_id).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {
                tracing::debug!(session = %session_id, "session deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete everything this identity has stored. Returns whether anything
    /// was removed.
    pub async fn wipe(self) -> Result<bool, CryptoboxError> {
        self.sessions.clear();
        let removed = self.store.delete_all().await?;
        tracing::info!(removed, "cryptobox wiped");
        Ok(removed)
    }

    /// Runs after every persisted transform: delete consumed prekeys, refill
    /// the pool, then cache the session.
    async fn cleanup(&self, session: CryptoboxSession<E::Session>) {
        let deleted = self
            .tracker
            .reconcile(&self.store, &self.prekey_cache)
            .await;
        self.pool.forget(&deleted);

        if let Err(e) = self.refill_prekeys().await {
            tracing::warn!(error = %e, "prekey refill failed, will retry on next pass");
        }

        self.sessions.put(session);
    }
}
