//! In-memory implementation of [`CryptoboxStore`].
//!
//! Suitable for tests and development. Data is lost on process exit; real
//! deployments implement the trait over their own database.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::prekey::{PreKeyId, StoredPreKey};
use crate::store::CryptoboxStore;

#[derive(Default)]
struct Records {
    identity: Option<Vec<u8>>,
    prekeys: BTreeMap<PreKeyId, Vec<u8>>,
    sessions: HashMap<String, Vec<u8>>,
}

impl Records {
    fn is_empty(&self) -> bool {
        self.identity.is_none() && self.prekeys.is_empty() && self.sessions.is_empty()
    }
}

/// In-memory store keeping every record behind a single lock.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// IDs of all stored prekeys, ascending.
    pub fn prekey_ids(&self) -> Vec<PreKeyId> {
        self.records.lock().prekeys.keys().copied().collect()
    }

    /// IDs of all stored sessions, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl CryptoboxStore for MemoryStore {
    async fn delete_all(&self) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        let had_records = !records.is_empty();
        *records = Records::default();
        Ok(had_records)
    }

    async fn load_identity(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.lock().identity.clone())
    }

    async fn save_identity(&self, identity: &[u8]) -> Result<(), StoreError> {
        self.records.lock().identity = Some(identity.to_vec());
        Ok(())
    }

    async fn load_prekey(&self, id: PreKeyId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.lock().prekeys.get(&id).cloned())
    }

    async fn load_prekeys(&self) -> Result<Vec<StoredPreKey>, StoreError> {
        Ok(self
            .records
            .lock()
            .prekeys
            .iter()
            .map(|(id, record)| StoredPreKey {
                id: *id,
                record: record.clone(),
            })
            .collect())
    }

    async fn save_prekey(&self, prekey: &StoredPreKey) -> Result<(), StoreError> {
        self.records
            .lock()
            .prekeys
            .insert(prekey.id, prekey.record.clone());
        Ok(())
    }

    async fn save_prekeys(&self, prekeys: &[StoredPreKey]) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        for prekey in prekeys {
            records.prekeys.insert(prekey.id, prekey.record.clone());
        }
        Ok(())
    }

    async fn delete_prekey(&self, id: PreKeyId) -> Result<PreKeyId, StoreError> {
        self.records.lock().prekeys.remove(&id);
        Ok(id)
    }

    async fn create_session(&self, id: &str, state: &[u8]) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        if records.sessions.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        records.sessions.insert(id.to_string(), state.to_vec());
        Ok(())
    }

    async fn update_session(&self, id: &str, state: &[u8]) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        match records.sessions.get_mut(id) {
            Some(stored) => {
                *stored = state.to_vec();
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn read_session(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.records
            .lock()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        self.records.lock().sessions.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: PreKeyId) -> StoredPreKey {
        StoredPreKey {
            id,
            record: vec![u8::try_from(id % 256).unwrap(); 4],
        }
    }

    #[tokio::test]
    async fn create_session_rejects_duplicates() {
        let store = MemoryStore::new();
        store.create_session("alice", b"one").await.unwrap();

        let err = store.create_session("alice", b"two").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.read_session("alice").await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn update_and_read_require_existing_session() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.update_session("bob", b"x").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.read_session("bob").await,
            Err(StoreError::NotFound(_))
        ));

        store.create_session("bob", b"x").await.unwrap();
        store.update_session("bob", b"y").await.unwrap();
        assert_eq!(store.read_session("bob").await.unwrap(), b"y");
    }

    #[tokio::test]
    async fn deletes_are_idempotent() {
        let store = MemoryStore::new();
        store.save_prekey(&stored(1)).await.unwrap();
        assert_eq!(store.delete_prekey(1).await.unwrap(), 1);
        assert_eq!(store.delete_prekey(1).await.unwrap(), 1);

        store.delete_session("nobody").await.unwrap();
    }

    #[tokio::test]
    async fn prekeys_load_in_id_order() {
        let store = MemoryStore::new();
        store
            .save_prekeys(&[stored(5), stored(2), stored(9)])
            .await
            .unwrap();

        let ids: Vec<_> = store.load_prekeys().await.unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert_eq!(store.load_prekey(5).await.unwrap(), Some(stored(5).record));
        assert_eq!(store.load_prekey(6).await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_all_wipes_everything() {
        let store = MemoryStore::new();
        assert!(!store.delete_all().await.unwrap());

        store.save_identity(b"me").await.unwrap();
        store.save_prekey(&stored(0)).await.unwrap();
        store.create_session("s", b"state").await.unwrap();

        assert!(store.delete_all().await.unwrap());
        assert!(store.load_identity().await.unwrap().is_none());
        assert!(store.prekey_ids().is_empty());
        assert!(store.session_ids().is_empty());
    }
}
