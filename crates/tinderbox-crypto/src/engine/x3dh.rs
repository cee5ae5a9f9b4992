use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::engine::identity::{peer_agreement_key, IdentityKeyPair};
use crate::engine::wire::{self, CipherMessage, Envelope, PreKeyBundle, PreKeyMessage};
use crate::engine::{PreKeySource, ProtocolEngine};
use crate::error::EngineError;
use crate::prekey::{PreKey, PreKeyId, LAST_RESORT_PREKEY_ID, STANDARD_PREKEY_ID_SPACE};

const X3DH_INFO: &[u8] = b"TinderboxX3DH";
const MESSAGE_KEY_INFO: &[u8] = b"TinderboxMsgKey";
const CHAIN_KEY_INFO: &[u8] = b"TinderboxChainKey";

/// Messages further ahead than this in the receiving chain are rejected.
const MAX_COUNTER_GAP: u64 = 1000;

/// X3DH key agreement with per-direction HKDF chains and AES-256-GCM.
///
/// Prekey secrets are X25519 scalars; identities are [`IdentityKeyPair`]s.
/// The initiator keeps wrapping its messages as prekey messages until it
/// hears back from the responder.
#[derive(Debug, Default, Clone, Copy)]
pub struct X3dhEngine;

impl X3dhEngine {
    pub fn new() -> Self {
        Self
    }

    fn generate_prekey(id: PreKeyId) -> PreKey {
        let secret = StaticSecret::random_from_rng(OsRng);
        PreKey::new(id, secret.to_bytes().to_vec())
    }

    /// Responder side of the key agreement.
    async fn accept(
        identity: &IdentityKeyPair,
        source: &dyn PreKeySource,
        message: &PreKeyMessage,
    ) -> Result<X3dhSession, EngineError> {
        let prekey = source.get(message.prekey_id).await?;
        let prekey_secret = x25519_secret(&prekey.key_material, "prekey")?;
        let their_identity = peer_agreement_key(&message.identity_key)?;
        let their_base = X25519Public::from(message.base_key);

        // Mirror of the initiator:
        // DH1 = DH(prekey, their_identity)
        // DH2 = DH(our_identity, their_base)
        // DH3 = DH(prekey, their_base)
        let dh1 = prekey_secret.diffie_hellman(&their_identity);
        let dh2 = identity.agreement_secret().diffie_hellman(&their_base);
        let dh3 = prekey_secret.diffie_hellman(&their_base);

        let okm = derive_root(&[dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()])?;
        Ok(X3dhSession {
            local_identity: identity.public_bytes(),
            remote_identity: message.identity_key,
            chains: ChainState::responder(&okm),
            pending_prekey: None,
            remote_base_key: Some(message.base_key),
        })
    }
}

/// Symmetric ratchet state for one session.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct ChainState {
    root_key: [u8; 32],
    sending_chain_key: [u8; 32],
    receiving_chain_key: [u8; 32],
    /// Messages sent so far.
    send_counter: u64,
    /// Highest counter received so far.
    recv_counter: u64,
}

impl ChainState {
    fn initiator(okm: &[u8; 96]) -> Self {
        Self::from_okm(okm, false)
    }

    /// Responder swaps sending and receiving relative to the initiator.
    fn responder(okm: &[u8; 96]) -> Self {
        Self::from_okm(okm, true)
    }

    fn from_okm(okm: &[u8; 96], swap: bool) -> Self {
        let mut root_key = [0u8; 32];
        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        root_key.copy_from_slice(&okm[..32]);
        first.copy_from_slice(&okm[32..64]);
        second.copy_from_slice(&okm[64..96]);
        let (sending_chain_key, receiving_chain_key) = if swap {
            (second, first)
        } else {
            (first, second)
        };
        Self {
            root_key,
            sending_chain_key,
            receiving_chain_key,
            send_counter: 0,
            recv_counter: 0,
        }
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<CipherMessage, EngineError> {
        let (message_key, next_chain_key) =
            step_chain(&self.sending_chain_key).map_err(EngineError::Encryption)?;
        let counter = self.send_counter + 1;
        let nonce = nonce_for(counter);

        let cipher = Aes256Gcm::new_from_slice(&message_key)
            .map_err(|e| EngineError::Encryption(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| EngineError::Encryption(e.to_string()))?;

        self.sending_chain_key = next_chain_key;
        self.send_counter = counter;
        Ok(CipherMessage {
            counter,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt `message`, skipping over chain steps for messages that never
    /// arrived. State is untouched on failure.
    fn open(&mut self, message: &CipherMessage) -> Result<Vec<u8>, EngineError> {
        if message.counter <= self.recv_counter {
            return Err(EngineError::DuplicateMessage(message.counter));
        }
        let gap = message.counter - self.recv_counter - 1;
        if gap > MAX_COUNTER_GAP {
            return Err(EngineError::TooDistantFuture(message.counter));
        }

        let mut chain_key = self.receiving_chain_key;
        for _ in 0..gap {
            chain_key = step_chain(&chain_key).map_err(EngineError::Decryption)?.1;
        }
        let (message_key, next_chain_key) =
            step_chain(&chain_key).map_err(EngineError::Decryption)?;
        chain_key.zeroize();

        let cipher = Aes256Gcm::new_from_slice(&message_key)
            .map_err(|e| EngineError::Decryption(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&message.nonce), message.ciphertext.as_slice())
            .map_err(|e| EngineError::Decryption(e.to_string()))?;

        self.receiving_chain_key = next_chain_key;
        self.recv_counter = message.counter;
        Ok(plaintext)
    }
}

/// Outstanding handshake data the initiator attaches to every message until
/// the responder answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingPreKey {
    prekey_id: PreKeyId,
    base_key: [u8; 32],
}

/// Session state produced by [`X3dhEngine`].
#[derive(Clone, Serialize, Deserialize)]
pub struct X3dhSession {
    local_identity: [u8; 32],
    remote_identity: [u8; 32],
    chains: ChainState,
    pending_prekey: Option<PendingPreKey>,
    /// Base key of the prekey message that created a responder session.
    remote_base_key: Option<[u8; 32]>,
}

impl X3dhSession {
    pub fn remote_identity(&self) -> &[u8; 32] {
        &self.remote_identity
    }

    /// Whether outgoing messages still carry the handshake.
    pub fn is_pending(&self) -> bool {
        self.pending_prekey.is_some()
    }

    pub fn messages_sent(&self) -> u64 {
        self.chains.send_counter
    }
}

impl std::fmt::Debug for X3dhSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X3dhSession")
            .field("remote_identity", &hex::encode(self.remote_identity))
            .field("pending_prekey", &self.pending_prekey)
            .field("send_counter", &self.chains.send_counter)
            .field("recv_counter", &self.chains.recv_counter)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProtocolEngine for X3dhEngine {
    type Identity = IdentityKeyPair;
    type Bundle = PreKeyBundle;
    type Session = X3dhSession;

    fn new_identity(&self) -> IdentityKeyPair {
        IdentityKeyPair::generate()
    }

    fn serialize_identity(&self, identity: &IdentityKeyPair) -> Result<Vec<u8>, EngineError> {
        Ok(identity.to_secret_bytes())
    }

    fn deserialize_identity(&self, bytes: &[u8]) -> Result<IdentityKeyPair, EngineError> {
        IdentityKeyPair::from_secret(bytes)
    }

    fn identity_fingerprint(&self, identity: &IdentityKeyPair) -> String {
        identity.fingerprint()
    }

    fn generate_prekeys(&self, start: PreKeyId, count: u16) -> Result<Vec<PreKey>, EngineError> {
        (0..u32::from(count))
            .map(|offset| -> Result<PreKey, EngineError> {
                let id = (u32::from(start) + offset) % STANDARD_PREKEY_ID_SPACE;
                let id = PreKeyId::try_from(id)
                    .map_err(|_| EngineError::InvalidKey(format!("prekey id {id} out of range")))?;
                Ok(Self::generate_prekey(id))
            })
            .collect()
    }

    fn last_resort_prekey(&self) -> Result<PreKey, EngineError> {
        Ok(Self::generate_prekey(LAST_RESORT_PREKEY_ID))
    }

    fn prekey_bundle(
        &self,
        identity: &IdentityKeyPair,
        prekey: &PreKey,
    ) -> Result<Vec<u8>, EngineError> {
        let secret = x25519_secret(&prekey.key_material, "prekey")?;
        let public_key = X25519Public::from(&secret).to_bytes();
        PreKeyBundle::signed(identity, prekey.id, public_key).to_bytes()
    }

    fn deserialize_bundle(&self, bytes: &[u8]) -> Result<PreKeyBundle, EngineError> {
        PreKeyBundle::from_bytes(bytes)
    }

    fn init_session_from_bundle(
        &self,
        identity: &IdentityKeyPair,
        bundle: &PreKeyBundle,
    ) -> Result<X3dhSession, EngineError> {
        let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519Public::from(&ephemeral_secret);

        let their_prekey = X25519Public::from(bundle.public_key);
        let their_identity = peer_agreement_key(&bundle.identity_key)?;

        // DH1 = DH(our_identity, their_prekey)
        // DH2 = DH(ephemeral, their_identity)
        // DH3 = DH(ephemeral, their_prekey)
        let dh1 = identity.agreement_secret().diffie_hellman(&their_prekey);
        let dh2 = ephemeral_secret.diffie_hellman(&their_identity);
        let dh3 = ephemeral_secret.diffie_hellman(&their_prekey);

        let okm = derive_root(&[dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()])?;
        Ok(X3dhSession {
            local_identity: identity.public_bytes(),
            remote_identity: bundle.identity_key,
            chains: ChainState::initiator(&okm),
            pending_prekey: Some(PendingPreKey {
                prekey_id: bundle.prekey_id,
                base_key: ephemeral_public.to_bytes(),
            }),
            remote_base_key: None,
        })
    }

    async fn init_session_from_envelope(
        &self,
        identity: &IdentityKeyPair,
        source: &dyn PreKeySource,
        envelope: &[u8],
    ) -> Result<(X3dhSession, Vec<u8>), EngineError> {
        let Envelope::PreKeyMessage(message) = Envelope::from_bytes(envelope)? else {
            return Err(EngineError::NotAPreKeyMessage);
        };

        let mut session = Self::accept(identity, source, &message).await?;
        let plaintext = session.chains.open(&message.message)?;
        if message.prekey_id != LAST_RESORT_PREKEY_ID {
            source.remove(message.prekey_id);
        }
        Ok((session, plaintext))
    }

    fn encrypt(
        &self,
        session: &mut X3dhSession,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let message = session.chains.seal(plaintext)?;
        let envelope = match &session.pending_prekey {
            Some(pending) => Envelope::PreKeyMessage(PreKeyMessage {
                prekey_id: pending.prekey_id,
                base_key: pending.base_key,
                identity_key: session.local_identity,
                message,
            }),
            None => Envelope::Message(message),
        };
        envelope.to_bytes()
    }

    async fn decrypt(
        &self,
        identity: &IdentityKeyPair,
        session: &mut X3dhSession,
        source: &dyn PreKeySource,
        envelope: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        match Envelope::from_bytes(envelope)? {
            Envelope::Message(message) => {
                let mut next = session.clone();
                let plaintext = next.chains.open(&message)?;
                // The peer answered, so it holds the session.
                next.pending_prekey = None;
                *session = next;
                Ok(plaintext)
            }
            Envelope::PreKeyMessage(message) => {
                if message.identity_key != session.remote_identity {
                    return Err(EngineError::InvalidKey("remote identity changed".into()));
                }
                if session.remote_base_key == Some(message.base_key) {
                    let mut next = session.clone();
                    let plaintext = next.chains.open(&message.message)?;
                    *session = next;
                    return Ok(plaintext);
                }

                // The peer started over with a fresh handshake.
                let mut fresh = Self::accept(identity, source, &message).await?;
                let plaintext = fresh.chains.open(&message.message)?;
                if message.prekey_id != LAST_RESORT_PREKEY_ID {
                    source.remove(message.prekey_id);
                }
                *session = fresh;
                Ok(plaintext)
            }
        }
    }

    fn serialize_session(&self, session: &X3dhSession) -> Result<Vec<u8>, EngineError> {
        wire::encode(session)
    }

    fn deserialize_session(
        &self,
        identity: &IdentityKeyPair,
        bytes: &[u8],
    ) -> Result<X3dhSession, EngineError> {
        let session: X3dhSession = wire::decode(bytes)?;
        if session.local_identity != identity.public_bytes() {
            return Err(EngineError::InvalidFormat(
                "session belongs to a different identity".into(),
            ));
        }
        Ok(session)
    }

    fn session_fingerprint(&self, session: &X3dhSession) -> String {
        hex::encode(session.remote_identity)
    }
}

fn x25519_secret(bytes: &[u8], what: &str) -> Result<StaticSecret, EngineError> {
    let secret = <[u8; 32]>::try_from(bytes)
        .map_err(|_| EngineError::InvalidKey(format!("{what} secret must be 32 bytes")))?;
    Ok(StaticSecret::from(secret))
}

fn derive_root(shared: &[&[u8; 32]]) -> Result<[u8; 96], EngineError> {
    let mut ikm = Vec::with_capacity(shared.len() * 32);
    for secret in shared {
        ikm.extend_from_slice(secret.as_slice());
    }
    let hk = Hkdf::<Sha256>::new(None, &ikm);
    ikm.zeroize();

    let mut okm = [0u8; 96];
    hk.expand(X3DH_INFO, &mut okm)
        .map_err(|e| EngineError::InvalidKey(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Returns `(message_key, next_chain_key)`.
fn step_chain(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), String> {
    let hk = Hkdf::<Sha256>::new(None, chain_key);
    let mut message_key = [0u8; 32];
    let mut next_chain_key = [0u8; 32];
    hk.expand(MESSAGE_KEY_INFO, &mut message_key)
        .map_err(|e| format!("HKDF: {e}"))?;
    hk.expand(CHAIN_KEY_INFO, &mut next_chain_key)
        .map_err(|e| format!("HKDF: {e}"))?;
    Ok((message_key, next_chain_key))
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}
