//! Protocol engine seam.
//!
//! The cryptobox never touches key agreement or ratchet state directly; it
//! drives a [`ProtocolEngine`] and persists whatever the engine serializes.
//! [`X3dhEngine`] is the bundled implementation.

pub mod identity;
pub mod wire;
pub mod x3dh;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::prekey::{PreKey, PreKeyId};

pub use identity::IdentityKeyPair;
pub use x3dh::{X3dhEngine, X3dhSession};

/// Prekey lookups available to the engine during a responder handshake.
#[async_trait]
pub trait PreKeySource: Send + Sync {
    /// Fails with [`EngineError::PreKeyNotFound`] for unknown or consumed IDs.
    async fn get(&self, id: PreKeyId) -> Result<PreKey, EngineError>;

    /// Flag `id` as consumed.
    ///
    /// Engines must call this synchronously, inside the handshake, before the
    /// derived session is handed back. From that point on `get(id)` fails, so
    /// a second handshake against the same prekey cannot slip through.
    fn remove(&self, id: PreKeyId);
}

#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    type Identity: Send + Sync;
    type Bundle: Send + Sync;
    type Session: Clone + Send + Sync;

    fn new_identity(&self) -> Self::Identity;

    fn serialize_identity(&self, identity: &Self::Identity) -> Result<Vec<u8>, EngineError>;

    fn deserialize_identity(&self, bytes: &[u8]) -> Result<Self::Identity, EngineError>;

    fn identity_fingerprint(&self, identity: &Self::Identity) -> String;

    /// Generate `count` standard prekeys with IDs `start, start + 1, ...`,
    /// wrapping before the last-resort ID.
    fn generate_prekeys(&self, start: PreKeyId, count: u16) -> Result<Vec<PreKey>, EngineError>;

    /// Generate the last-resort prekey (ID `65535`).
    fn last_resort_prekey(&self) -> Result<PreKey, EngineError>;

    /// Serialized public bundle a peer needs to start a session with us.
    fn prekey_bundle(
        &self,
        identity: &Self::Identity,
        prekey: &PreKey,
    ) -> Result<Vec<u8>, EngineError>;

    /// Fails with [`EngineError::InvalidFormat`] on malformed input.
    fn deserialize_bundle(&self, bytes: &[u8]) -> Result<Self::Bundle, EngineError>;

    fn init_session_from_bundle(
        &self,
        identity: &Self::Identity,
        bundle: &Self::Bundle,
    ) -> Result<Self::Session, EngineError>;

    /// Derive a session from a peer's first message and decrypt its payload
    /// in one step. The consumed prekey is removed from `source` before this
    /// returns.
    async fn init_session_from_envelope(
        &self,
        identity: &Self::Identity,
        source: &dyn PreKeySource,
        envelope: &[u8],
    ) -> Result<(Self::Session, Vec<u8>), EngineError>;

    fn encrypt(&self, session: &mut Self::Session, plaintext: &[u8])
        -> Result<Vec<u8>, EngineError>;

    /// Decrypt with an existing session. `session` is only advanced on success.
    async fn decrypt(
        &self,
        identity: &Self::Identity,
        session: &mut Self::Session,
        source: &dyn PreKeySource,
        envelope: &[u8],
    ) -> Result<Vec<u8>, EngineError>;

    fn serialize_session(&self, session: &Self::Session) -> Result<Vec<u8>, EngineError>;

    fn deserialize_session(
        &self,
        identity: &Self::Identity,
        bytes: &[u8],
    ) -> Result<Self::Session, EngineError>;

    /// Fingerprint of the remote identity bound to `session`.
    fn session_fingerprint(&self, session: &Self::Session) -> String;
}
