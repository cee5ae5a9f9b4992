use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::prekey::{PreKeyId, StoredPreKey};
use crate::store::{CryptoboxStore, MemoryStore};

/// In-memory store whose prekey writes and deletes can be made to fail or
/// to yield to the scheduler first.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_saves: AtomicBool,
    fail_deletes: AtomicBool,
    yield_on_delete: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn yield_on_delete(&self, enabled: bool) {
        self.yield_on_delete.store(enabled, Ordering::SeqCst);
    }

    fn check_save(&self) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CryptoboxStore for FlakyStore {
    async fn delete_all(&self) -> Result<bool, StoreError> {
        self.inner.delete_all().await
    }

    async fn load_identity(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load_identity().await
    }

    async fn save_identity(&self, identity: &[u8]) -> Result<(), StoreError> {
        self.inner.save_identity(identity).await
    }

    async fn load_prekey(&self, id: PreKeyId) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load_prekey(id).await
    }

    async fn load_prekeys(&self) -> Result<Vec<StoredPreKey>, StoreError> {
        self.inner.load_prekeys().await
    }

    async fn save_prekey(&self, prekey: &StoredPreKey) -> Result<(), StoreError> {
        self.check_save()?;
        self.inner.save_prekey(prekey).await
    }

    async fn save_prekeys(&self, prekeys: &[StoredPreKey]) -> Result<(), StoreError> {
        self.check_save()?;
        self.inner.save_prekeys(prekeys).await
    }

    async fn delete_prekey(&self, id: PreKeyId) -> Result<PreKeyId, StoreError> {
        if self.yield_on_delete.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk unavailable".into()));
        }
        self.inner.delete_prekey(id).await
    }

    async fn create_session(&self, id: &str, state: &[u8]) -> Result<(), StoreError> {
        self.inner.create_session(id, state).await
    }

    async fn update_session(&self, id: &str, state: &[u8]) -> Result<(), StoreError> {
        self.inner.update_session(id, state).await
    }

    async fn read_session(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.read_session(id).await
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete_session(id).await
    }
}
