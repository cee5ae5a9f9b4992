//! Identity keys for [`X3dhEngine`](super::X3dhEngine).
//!
//! An identity is one Ed25519 key. It signs prekey bundles, and its
//! Montgomery form is the X25519 key used in the handshake, so peers only
//! exchange the Ed25519 public key.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::EngineError;
use crate::prekey::PreKeyId;

#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from the bytes produced by [`Self::to_secret_bytes`].
    pub fn from_secret(bytes: &[u8]) -> Result<Self, EngineError> {
        let secret = Zeroizing::new(
            <[u8; 32]>::try_from(bytes)
                .map_err(|_| EngineError::InvalidKey("identity secret must be 32 bytes".into()))?,
        );
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    pub fn to_secret_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Hex-encoded public key.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.public_bytes())
    }

    pub(crate) fn sign_prekey(&self, prekey_id: PreKeyId, public_key: &[u8; 32]) -> Vec<u8> {
        self.signing_key
            .sign(&prekey_payload(prekey_id, public_key))
            .to_bytes()
            .to_vec()
    }

    /// X25519 secret from the SHA-512-expanded Ed25519 scalar. Agrees with
    /// [`peer_agreement_key`] applied to our public key.
    pub(crate) fn agreement_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing_key.to_scalar_bytes())
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Check a bundle signature made by the owner of `identity_key`.
pub(crate) fn verify_prekey(
    identity_key: &[u8; 32],
    prekey_id: PreKeyId,
    public_key: &[u8; 32],
    signature: &[u8],
) -> Result<(), EngineError> {
    let identity_key = VerifyingKey::from_bytes(identity_key)
        .map_err(|e| EngineError::InvalidFormat(format!("bad identity key: {e}")))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| EngineError::InvalidFormat(format!("bad signature: {e}")))?;
    identity_key
        .verify(&prekey_payload(prekey_id, public_key), &signature)
        .map_err(|_| EngineError::InvalidFormat("bundle signature does not verify".into()))
}

/// The X25519 key a peer agrees with, derived from its Ed25519 identity.
pub(crate) fn peer_agreement_key(identity_key: &[u8; 32]) -> Result<X25519Public, EngineError> {
    let verifying_key = VerifyingKey::from_bytes(identity_key)
        .map_err(|e| EngineError::InvalidKey(format!("invalid Ed25519 public key: {e}")))?;
    Ok(X25519Public::from(verifying_key.to_montgomery().to_bytes()))
}

fn prekey_payload(prekey_id: PreKeyId, public_key: &[u8; 32]) -> [u8; 34] {
    let mut payload = [0u8; 34];
    payload[..2].copy_from_slice(&prekey_id.to_le_bytes());
    payload[2..].copy_from_slice(public_key);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prekey_signature_binds_id_and_key() {
        let identity = IdentityKeyPair::generate();
        let signature = identity.sign_prekey(7, &[3u8; 32]);
        let public = identity.public_bytes();

        assert!(verify_prekey(&public, 7, &[3u8; 32], &signature).is_ok());
        assert!(verify_prekey(&public, 8, &[3u8; 32], &signature).is_err());
        assert!(verify_prekey(&public, 7, &[4u8; 32], &signature).is_err());
    }

    #[test]
    fn restored_identity_keeps_fingerprint() {
        let identity = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret(&identity.to_secret_bytes()).unwrap();
        assert_eq!(identity.fingerprint(), restored.fingerprint());
        assert_eq!(identity.fingerprint().len(), 64);
    }

    #[test]
    fn short_secret_is_rejected() {
        assert!(matches!(
            IdentityKeyPair::from_secret(&[1u8; 31]),
            Err(EngineError::InvalidKey(_))
        ));
    }

    #[test]
    fn agreement_keys_meet_in_the_middle() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let bob_public = peer_agreement_key(&bob.public_bytes()).unwrap();
        let alice_public = peer_agreement_key(&alice.public_bytes()).unwrap();

        let shared_a = alice.agreement_secret().diffie_hellman(&bob_public);
        let shared_b = bob.agreement_secret().diffie_hellman(&alice_public);
        assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());
    }
}
