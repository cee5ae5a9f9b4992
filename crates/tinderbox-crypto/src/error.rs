use std::fmt;

use thiserror::Error;

use crate::prekey::PreKeyId;

/// Errors reported by a [`CryptoboxStore`](crate::store::CryptoboxStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors reported by a [`ProtocolEngine`](crate::engine::ProtocolEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("prekey {0} not found")]
    PreKeyNotFound(PreKeyId),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("duplicate or outdated message (counter {0})")]
    DuplicateMessage(u64),

    #[error("message counter {0} is too far ahead")]
    TooDistantFuture(u64),

    #[error("not a prekey message")]
    NotAPreKeyMessage,

    #[error("prekey source error: {0}")]
    Source(#[from] StoreError),
}

/// Output of a cryptographic transform that could not be persisted.
///
/// Keeps the bytes out of `Debug` output.
pub struct Payload(pub Vec<u8>);

impl Payload {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

/// Errors surfaced by [`Cryptobox`](crate::Cryptobox).
#[derive(Debug, Error)]
pub enum CryptoboxError {
    #[error("invalid prekey bundle: {0}")]
    InvalidPreKeyFormat(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("cannot decrypt an empty ciphertext")]
    EmptyCiphertext,

    #[error("prekey {0} not found")]
    PreKeyNotFound(PreKeyId),

    #[error("no local identity in storage")]
    IdentityMissing,

    #[error("no last-resort prekey in storage")]
    LastResortMissing,

    #[error("no free prekey ID window for {0} prekeys")]
    PreKeyIdsExhausted(u32),

    #[error("failed to encode {kind}: {reason}")]
    Encoding { kind: &'static str, reason: String },

    #[error("corrupt {kind} record: {reason}")]
    CorruptRecord { kind: &'static str, reason: String },

    /// The transform succeeded but the resulting session state was not saved.
    /// `output` holds the ciphertext (encrypt) or plaintext (decrypt).
    #[error("session {session_id} could not be persisted: {source}")]
    UnsavedSession {
        session_id: String,
        output: Payload,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Engine(EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<EngineError> for CryptoboxError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::PreKeyNotFound(id) => Self::PreKeyNotFound(id),
            EngineError::Source(store) => Self::Store(store),
            other => Self::Engine(other),
        }
    }
}
