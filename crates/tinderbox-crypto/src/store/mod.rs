//! Durable storage contract.
//!
//! Records cross this boundary as opaque bytes produced by the protocol
//! engine; backends persist them verbatim.

pub mod memory;
#[cfg(test)]
pub(crate) mod test_stores;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::prekey::{PreKeyId, StoredPreKey};

pub use memory::MemoryStore;

/// Storage backend for one local identity.
#[async_trait]
pub trait CryptoboxStore: Send + Sync {
    /// Wipe every record. Returns whether anything was removed.
    async fn delete_all(&self) -> Result<bool, StoreError>;

    async fn load_identity(&self) -> Result<Option<Vec<u8>>, StoreError>;

    async fn save_identity(&self, identity: &[u8]) -> Result<(), StoreError>;

    async fn load_prekey(&self, id: PreKeyId) -> Result<Option<Vec<u8>>, StoreError>;

    async fn load_prekeys(&self) -> Result<Vec<StoredPreKey>, StoreError>;

    async fn save_prekey(&self, prekey: &StoredPreKey) -> Result<(), StoreError>;

    /// Persist a batch of prekeys. Backends should make this all-or-nothing.
    async fn save_prekeys(&self, prekeys: &[StoredPreKey]) -> Result<(), StoreError> {
        for prekey in prekeys {
            self.save_prekey(prekey).await?;
        }
        Ok(())
    }

    /// Delete a prekey. Deleting an absent prekey is not an error.
    async fn delete_prekey(&self, id: PreKeyId) -> Result<PreKeyId, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] if `id` is already present.
    async fn create_session(&self, id: &str, state: &[u8]) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] if `id` is absent.
    async fn update_session(&self, id: &str, state: &[u8]) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] if `id` is absent.
    async fn read_session(&self, id: &str) -> Result<Vec<u8>, StoreError>;

    /// Delete a session. Deleting an absent session is not an error.
    async fn delete_session(&self, id: &str) -> Result<(), StoreError>;
}
