//! Prekey records and their publishable form.
//!
//! Standard prekeys are single-use and live under IDs `0..=65534`. The ID
//! [`LAST_RESORT_PREKEY_ID`] belongs to the last-resort prekey, which is
//! offered when no standard prekey is left and is never deleted.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub type PreKeyId = u16;

/// Reserved ID of the permanent last-resort prekey.
pub const LAST_RESORT_PREKEY_ID: PreKeyId = u16::MAX;

/// Number of IDs available to standard prekeys.
pub const STANDARD_PREKEY_ID_SPACE: u32 = LAST_RESORT_PREKEY_ID as u32;

/// A single prekey. The key material is opaque to everything but the
/// protocol engine that generated it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PreKey {
    #[zeroize(skip)]
    pub id: PreKeyId,
    pub key_material: Vec<u8>,
}

impl PreKey {
    pub fn new(id: PreKeyId, key_material: Vec<u8>) -> Self {
        Self { id, key_material }
    }

    pub fn is_last_resort(&self) -> bool {
        self.id == LAST_RESORT_PREKEY_ID
    }

    /// Encode for durable storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl std::fmt::Debug for PreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKey").field("id", &self.id).finish_non_exhaustive()
    }
}

/// A prekey as stored by a [`CryptoboxStore`](crate::store::CryptoboxStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPreKey {
    pub id: PreKeyId,
    pub record: Vec<u8>,
}

/// Public bundle for one prekey, ready for upload.
///
/// `key` is the engine's serialized bundle, base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedPreKey {
    pub id: PreKeyId,
    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_resort_id_is_u16_max() {
        let prekey = PreKey::new(LAST_RESORT_PREKEY_ID, vec![7; 32]);
        assert!(prekey.is_last_resort());
        assert!(!PreKey::new(0, vec![7; 32]).is_last_resort());
    }

    #[test]
    fn stored_bytes_decode_to_same_prekey() {
        let prekey = PreKey::new(42, vec![1, 2, 3, 4]);
        let bytes = prekey.to_bytes().unwrap();
        assert_eq!(PreKey::from_bytes(&bytes).unwrap(), prekey);
    }

    #[test]
    fn debug_hides_key_material() {
        let prekey = PreKey::new(3, vec![0xAB; 32]);
        let rendered = format!("{prekey:?}");
        assert!(rendered.contains("id: 3"));
        assert!(!rendered.contains("171"));
    }
}
