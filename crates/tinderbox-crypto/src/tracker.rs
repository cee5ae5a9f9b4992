//! Tracking of prekeys consumed by in-flight handshakes.
//!
//! A prekey goes `Live → PendingRemoval → Deleted`. It becomes pending the
//! moment the engine consumes it, and stays physically in storage until
//! [`ConsumptionTracker::reconcile`] deletes it after the session that used it
//! has been persisted.

use std::collections::BTreeSet;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::engine::PreKeySource;
use crate::error::EngineError;
use crate::lru::LruCache;
use crate::prekey::{PreKey, PreKeyId, LAST_RESORT_PREKEY_ID};
use crate::store::CryptoboxStore;

/// Prekey IDs flagged as consumed but not yet deleted from storage.
#[derive(Debug, Default)]
pub struct ConsumptionTracker {
    pending: Mutex<BTreeSet<PreKeyId>>,
}

impl ConsumptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag `id` as pending removal. Idempotent. The last-resort prekey is
    /// never consumed and is ignored.
    pub fn mark_removed(&self, id: PreKeyId) {
        if id == LAST_RESORT_PREKEY_ID {
            return;
        }
        if self.pending.lock().insert(id) {
            tracing::debug!(prekey = id, "prekey consumed, pending removal");
        }
    }

    pub fn is_removed(&self, id: PreKeyId) -> bool {
        self.pending.lock().contains(&id)
    }

    pub fn pending_ids(&self) -> Vec<PreKeyId> {
        self.pending.lock().iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Delete every pending prekey from `store` and evict it from `cache`.
    ///
    /// Returns the IDs that were deleted. IDs whose deletion failed stay
    /// pending and are retried on the next pass. An ID is evicted before it
    /// leaves the pending set, so no lookup can find it in between.
    pub async fn reconcile<S: CryptoboxStore + ?Sized>(
        &self,
        store: &S,
        cache: &Mutex<LruCache<PreKeyId, PreKey>>,
    ) -> Vec<PreKeyId> {
        let pending = self.pending_ids();
        let mut deleted = Vec::with_capacity(pending.len());

        for id in pending {
            match store.delete_prekey(id).await {
                Ok(_) => {
                    cache.lock().delete(&id);
                    self.pending.lock().remove(&id);
                    deleted.push(id);
                }
                Err(e) => {
                    tracing::warn!(prekey = id, error = %e, "failed to delete consumed prekey, will retry");
                }
            }
        }

        if !deleted.is_empty() {
            tracing::debug!(?deleted, "reconciled consumed prekeys");
        }
        deleted
    }
}

/// Read-only view of the prekey store handed to the protocol engine.
///
/// Lookups go through the prekey cache and then durable storage, but fail for
/// anything the tracker has flagged. Only the last-resort prekey is cached. Removals only flag; nothing is deleted
/// until reconciliation.
pub struct TrackedPreKeys<'a, S: ?Sized> {
    tracker: &'a ConsumptionTracker,
    cache: &'a Mutex<LruCache<PreKeyId, PreKey>>,
    store: &'a S,
}

impl<'a, S: CryptoboxStore + ?Sized> TrackedPreKeys<'a, S> {
    pub fn new(
        tracker: &'a ConsumptionTracker,
        cache: &'a Mutex<LruCache<PreKeyId, PreKey>>,
        store: &'a S,
    ) -> Self {
        Self {
            tracker,
            cache,
            store,
        }
    }
}

#[async_trait]
impl<S: CryptoboxStore + ?Sized> PreKeySource for TrackedPreKeys<'_, S> {
    async fn get(&self, id: PreKeyId) -> Result<PreKey, EngineError> {
        if self.tracker.is_removed(id) {
            return Err(EngineError::PreKeyNotFound(id));
        }
        let cached = self.cache.lock().get(&id).cloned();
        if let Some(prekey) = cached {
            return Ok(prekey);
        }

        let record = self
            .store
            .load_prekey(id)
            .await?
            .ok_or(EngineError::PreKeyNotFound(id))?;
        let prekey = PreKey::from_bytes(&record)
            .map_err(|e| EngineError::InvalidFormat(format!("prekey {id}: {e}")))?;

        // Re-check: the prekey may have been consumed while storage was read.
        if self.tracker.is_removed(id) {
            return Err(EngineError::PreKeyNotFound(id));
        }
        // Standard prekeys are single-use; only the last resort is worth keeping.
        if prekey.is_last_resort() {
            self.cache.lock().set(id, prekey.clone());
        }
        Ok(prekey)
    }

    fn remove(&self, id: PreKeyId) {
        self.tracker.mark_removed(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prekey::StoredPreKey;
    use crate::store::test_stores::FlakyStore;

    async fn store_with(ids: &[PreKeyId]) -> FlakyStore {
        let store = FlakyStore::new();
        for &id in ids {
            let record = PreKey::new(id, vec![1; 32]).to_bytes().unwrap();
            store.save_prekey(&StoredPreKey { id, record }).await.unwrap();
        }
        store
    }

    #[test]
    fn mark_removed_is_idempotent() {
        let tracker = ConsumptionTracker::new();
        tracker.mark_removed(4);
        tracker.mark_removed(4);
        assert_eq!(tracker.pending_ids(), vec![4]);
    }

    #[test]
    fn last_resort_is_never_tracked() {
        let tracker = ConsumptionTracker::new();
        tracker.mark_removed(LAST_RESORT_PREKEY_ID);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn removed_prekey_lookup_fails_while_still_stored() {
        let store = store_with(&[0, 1]).await;
        let tracker = ConsumptionTracker::new();
        let cache = Mutex::new(LruCache::new(4));
        let source = TrackedPreKeys::new(&tracker, &cache, &store);

        assert_eq!(source.get(0).await.unwrap().id, 0);
        source.remove(0);

        assert!(matches!(source.get(0).await, Err(EngineError::PreKeyNotFound(0))));
        assert_eq!(store.inner.prekey_ids(), vec![0, 1]);
        assert_eq!(source.get(1).await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn missing_prekey_is_not_found() {
        let store = store_with(&[]).await;
        let tracker = ConsumptionTracker::new();
        let cache = Mutex::new(LruCache::new(1));
        let source = TrackedPreKeys::new(&tracker, &cache, &store);

        assert!(matches!(source.get(9).await, Err(EngineError::PreKeyNotFound(9))));
    }

    #[tokio::test]
    async fn only_last_resort_is_cached() {
        let store = store_with(&[0, LAST_RESORT_PREKEY_ID]).await;
        let tracker = ConsumptionTracker::new();
        let cache = Mutex::new(LruCache::new(1));
        let source = TrackedPreKeys::new(&tracker, &cache, &store);

        source.get(LAST_RESORT_PREKEY_ID).await.unwrap();
        source.get(0).await.unwrap();

        assert!(cache.lock().contains(&LAST_RESORT_PREKEY_ID));
        assert!(!cache.lock().contains(&0));
    }

    #[tokio::test]
    async fn reconcile_deletes_and_clears_pending() {
        let store = store_with(&[0, 1, 2]).await;
        let tracker = ConsumptionTracker::new();
        let cache = Mutex::new(LruCache::new(4));
        cache.lock().set(0, PreKey::new(0, vec![1; 32]));
        tracker.mark_removed(0);
        tracker.mark_removed(2);

        let deleted = tracker.reconcile(&store, &cache).await;
        assert_eq!(deleted, vec![0, 2]);
        assert!(tracker.is_empty());
        assert!(cache.lock().is_empty());
        assert_eq!(store.inner.prekey_ids(), vec![1]);
    }

    #[tokio::test]
    async fn deleted_prekey_is_not_served_while_reconcile_runs() {
        let store = store_with(&[0, 1]).await;
        store.yield_on_delete(true);
        let tracker = ConsumptionTracker::new();
        let cache = Mutex::new(LruCache::new(4));
        cache.lock().set(0, PreKey::new(0, vec![1; 32]));
        cache.lock().set(1, PreKey::new(1, vec![1; 32]));
        tracker.mark_removed(0);
        tracker.mark_removed(1);
        let source = TrackedPreKeys::new(&tracker, &cache, &store);

        // The lookup runs after 0 is deleted while 1 is still being deleted.
        let (deleted, (lookup, still_pending)) =
            tokio::join!(tracker.reconcile(&store, &cache), async {
                tokio::task::yield_now().await;
                (source.get(0).await, tracker.pending_ids())
            });

        assert_eq!(still_pending, vec![1]);
        assert_eq!(deleted, vec![0, 1]);
        assert!(matches!(lookup, Err(EngineError::PreKeyNotFound(0))));
        assert!(store.inner.prekey_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_deletion_stays_pending() {
        let store = store_with(&[5]).await;
        store.fail_deletes(true);
        let tracker = ConsumptionTracker::new();
        let cache = Mutex::new(LruCache::new(1));
        tracker.mark_removed(5);

        assert!(tracker.reconcile(&store, &cache).await.is_empty());
        assert_eq!(tracker.pending_ids(), vec![5]);
        assert_eq!(store.inner.prekey_ids(), vec![5]);
    }
}
