//! Wire types for [`X3dhEngine`](super::X3dhEngine): prekey bundles and
//! message envelopes.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::identity::{self, IdentityKeyPair};
use crate::error::EngineError;
use crate::prekey::PreKeyId;

pub const BUNDLE_VERSION: u8 = 1;

/// Upper bound on any encoded wire value.
const MAX_WIRE_LEN: u64 = 16 * 1024 * 1024;

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_WIRE_LEN)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
    codec()
        .serialize(value)
        .map_err(|e| EngineError::InvalidFormat(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EngineError> {
    codec()
        .deserialize(bytes)
        .map_err(|e| EngineError::InvalidFormat(e.to_string()))
}

/// Public half of one prekey, signed by the owner's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub version: u8,
    pub prekey_id: PreKeyId,
    /// X25519 public prekey.
    pub public_key: [u8; 32],
    /// Ed25519 identity public key.
    pub identity_key: [u8; 32],
    /// Signature over `prekey_id || public_key`.
    pub signature: Vec<u8>,
}

impl PreKeyBundle {
    pub fn signed(identity: &IdentityKeyPair, prekey_id: PreKeyId, public_key: [u8; 32]) -> Self {
        Self {
            version: BUNDLE_VERSION,
            prekey_id,
            public_key,
            identity_key: identity.public_bytes(),
            signature: identity.sign_prekey(prekey_id, &public_key),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        encode(self)
    }

    /// Decode and check version and signature.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        let bundle: Self = decode(bytes)?;
        if bundle.version != BUNDLE_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "unsupported bundle version {}",
                bundle.version
            )));
        }

        identity::verify_prekey(
            &bundle.identity_key,
            bundle.prekey_id,
            &bundle.public_key,
            &bundle.signature,
        )?;

        Ok(bundle)
    }
}

/// One symmetric-chain message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherMessage {
    /// 1-based position in the sender's chain.
    pub counter: u64,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// First messages from an initiator; carries what the responder needs to
/// derive the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMessage {
    pub prekey_id: PreKeyId,
    /// Initiator's ephemeral X25519 public key.
    pub base_key: [u8; 32],
    /// Initiator's Ed25519 identity public key.
    pub identity_key: [u8; 32],
    pub message: CipherMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    PreKeyMessage(PreKeyMessage),
    Message(CipherMessage),
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        decode(bytes)
    }
}
