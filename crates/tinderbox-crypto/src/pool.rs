//! The pool of prekeys peers can start sessions with.
//!
//! IDs are handed out from a cursor that only moves forward through the
//! standard ID space, so an ID is not reissued within a process lifetime
//! until the space wraps. On load the cursor starts right after the highest
//! stored ID.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use crate::engine::ProtocolEngine;
use crate::error::CryptoboxError;
use crate::prekey::{PreKey, PreKeyId, StoredPreKey, STANDARD_PREKEY_ID_SPACE};
use crate::store::CryptoboxStore;
use crate::tracker::ConsumptionTracker;

#[derive(Debug, Default)]
struct PoolState {
    live: BTreeMap<PreKeyId, PreKey>,
    last_resort: Option<PreKey>,
    /// IDs claimed by replenishments that are still persisting.
    reserved: BTreeSet<PreKeyId>,
    cursor: u32,
}

impl PoolState {
    fn is_free(&self, id: PreKeyId, consumed: &BTreeSet<PreKeyId>) -> bool {
        !self.live.contains_key(&id) && !self.reserved.contains(&id) && !consumed.contains(&id)
    }

    /// First start at or after the cursor with `count` consecutive free IDs.
    fn find_window(&self, count: u32, consumed: &BTreeSet<PreKeyId>) -> Option<u32> {
        let mut start = self.cursor;
        let mut scanned = 0u32;
        'search: while scanned < STANDARD_PREKEY_ID_SPACE {
            for offset in 0..count {
                let id = wrap(start + offset);
                if !self.is_free(id, consumed) {
                    start = u32::from(id) + 1;
                    scanned += offset + 1;
                    continue 'search;
                }
            }
            return Some(start % STANDARD_PREKEY_ID_SPACE);
        }
        None
    }
}

fn wrap(id: u32) -> PreKeyId {
    // Always below STANDARD_PREKEY_ID_SPACE, which fits in a u16.
    PreKeyId::try_from(id % STANDARD_PREKEY_ID_SPACE).unwrap_or_default()
}

/// Live standard prekeys plus the last-resort prekey for one identity.
#[derive(Debug, Default)]
pub struct PreKeyPool {
    state: Mutex<PoolState>,
}

impl PreKeyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pool contents with prekeys loaded from storage.
    pub fn seed(&self, prekeys: Vec<PreKey>) {
        let mut state = self.state.lock();
        *state = PoolState::default();
        for prekey in prekeys {
            if prekey.is_last_resort() {
                state.last_resort = Some(prekey);
            } else {
                state.live.insert(prekey.id, prekey);
            }
        }
        state.cursor = state
            .live
            .keys()
            .next_back()
            .map_or(0, |max| (u32::from(*max) + 1) % STANDARD_PREKEY_ID_SPACE);
    }

    pub fn last_resort(&self) -> Option<PreKey> {
        self.state.lock().last_resort.clone()
    }

    pub fn get(&self, id: PreKeyId) -> Option<PreKey> {
        let state = self.state.lock();
        match &state.last_resort {
            Some(last_resort) if last_resort.id == id => Some(last_resort.clone()),
            _ => state.live.get(&id).cloned(),
        }
    }

    /// Standard prekeys in ID order.
    pub fn standard_prekeys(&self) -> Vec<PreKey> {
        self.state.lock().live.values().cloned().collect()
    }

    pub fn standard_ids(&self) -> Vec<PreKeyId> {
        self.state.lock().live.keys().copied().collect()
    }

    /// Number of standard prekeys, including consumed ones not yet forgotten.
    pub fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().live.is_empty()
    }

    /// Drop reconciled prekeys from the pool view.
    pub fn forget(&self, ids: &[PreKeyId]) {
        let mut state = self.state.lock();
        for id in ids {
            state.live.remove(id);
        }
    }

    /// Generate and persist the last-resort prekey.
    pub async fn create_last_resort<E, S>(
        &self,
        engine: &E,
        store: &S,
    ) -> Result<PreKey, CryptoboxError>
    where
        E: ProtocolEngine + ?Sized,
        S: CryptoboxStore + ?Sized,
    {
        let prekey = engine.last_resort_prekey()?;
        store.save_prekey(&to_stored(&prekey)?).await?;
        self.state.lock().last_resort = Some(prekey.clone());
        tracing::debug!("created last-resort prekey");
        Ok(prekey)
    }

    /// Top the pool up to `minimum` available standard prekeys.
    ///
    /// Prekeys flagged by `tracker` do not count as available and their IDs are
    /// not reused. Returns the prekeys created. If generation or persistence
    /// fails the pool is left as it was.
    pub async fn ensure_minimum<E, S>(
        &self,
        minimum: u32,
        engine: &E,
        store: &S,
        tracker: &ConsumptionTracker,
    ) -> Result<Vec<PreKey>, CryptoboxError>
    where
        E: ProtocolEngine + ?Sized,
        S: CryptoboxStore + ?Sized,
    {
        let consumed: BTreeSet<PreKeyId> = tracker.pending_ids().into_iter().collect();

        let (start, count, previous_cursor) = {
            let mut state = self.state.lock();
            let available = state
                .live
                .keys()
                .filter(|id| !consumed.contains(id))
                .count()
                + state.reserved.len();
            let available = u32::try_from(available).unwrap_or(u32::MAX);
            let missing = minimum.saturating_sub(available);
            if missing == 0 {
                return Ok(Vec::new());
            }

            let start = state
                .find_window(missing, &consumed)
                .ok_or(CryptoboxError::PreKeyIdsExhausted(missing))?;
            for offset in 0..missing {
                state.reserved.insert(wrap(start + offset));
            }
            let previous_cursor = state.cursor;
            state.cursor = (start + missing) % STANDARD_PREKEY_ID_SPACE;
            (start, missing, previous_cursor)
        };

        match self.generate_and_store(engine, store, start, count).await {
            Ok(prekeys) => {
                let mut state = self.state.lock();
                for prekey in &prekeys {
                    state.reserved.remove(&prekey.id);
                    state.live.insert(prekey.id, prekey.clone());
                }
                tracing::debug!(start, count, "replenished prekeys");
                Ok(prekeys)
            }
            Err(e) => {
                let mut state = self.state.lock();
                for offset in 0..count {
                    state.reserved.remove(&wrap(start + offset));
                }
                // Hand the IDs back unless another replenishment moved past them.
                if state.cursor == (start + count) % STANDARD_PREKEY_ID_SPACE {
                    state.cursor = previous_cursor;
                }
                tracing::warn!(start, count, error = %e, "prekey replenishment failed");
                Err(e)
            }
        }
    }

    async fn generate_and_store<E, S>(
        &self,
        engine: &E,
        store: &S,
        start: u32,
        count: u32,
    ) -> Result<Vec<PreKey>, CryptoboxError>
    where
        E: ProtocolEngine + ?Sized,
        S: CryptoboxStore + ?Sized,
    {
        let count = u16::try_from(count).map_err(|_| CryptoboxError::PreKeyIdsExhausted(count))?;
        let prekeys = engine.generate_prekeys(wrap(start), count)?;
        let records = prekeys
            .iter()
            .map(to_stored)
            .collect::<Result<Vec<_>, _>>()?;
        store.save_prekeys(&records).await?;
        Ok(prekeys)
    }
}

pub(crate) fn to_stored(prekey: &PreKey) -> Result<StoredPreKey, CryptoboxError> {
    let record = prekey.to_bytes().map_err(|e| CryptoboxError::Encoding {
        kind: "prekey",
        reason: e.to_string(),
    })?;
    Ok(StoredPreKey {
        id: prekey.id,
        record,
    })
}
