use parking_lot::Mutex;

use crate::lru::LruCache;

/// A session as the cryptobox hands it out: its identifier plus the engine's
/// protocol state. The durable store holds the authoritative copy.
#[derive(Debug, Clone)]
pub struct CryptoboxSession<T> {
    pub id: String,
    pub state: T,
}

impl<T> CryptoboxSession<T> {
    pub fn new(id: impl Into<String>, state: T) -> Self {
        Self {
            id: id.into(),
            state,
        }
    }
}

/// Bounded cache of recently used sessions.
///
/// Only sessions that are already durable may be put here; eviction just
/// drops the in-memory copy.
pub struct SessionCache<T> {
    cache: Mutex<LruCache<String, CryptoboxSession<T>>>,
}

impl<T: Clone> SessionCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Insert or refresh `session`. Returns whatever it displaced.
    pub fn put(&self, session: CryptoboxSession<T>) -> Option<CryptoboxSession<T>> {
        let evicted = self.cache.lock().set(session.id.clone(), session);
        if let Some(evicted) = &evicted {
            tracing::trace!(session = %evicted.id, "session left the cache");
        }
        evicted
    }

    pub fn get(&self, id: &str) -> Option<CryptoboxSession<T>> {
        self.cache.lock().get(id).cloned()
    }

    pub fn invalidate(&self, id: &str) -> bool {
        self.cache.lock().delete(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cache.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().size()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_invalidate() {
        let cache = SessionCache::new(10);
        assert!(cache.put(CryptoboxSession::new("a", 1u32)).is_none());
        assert_eq!(cache.get("a").map(|s| s.state), Some(1));

        assert!(cache.invalidate("a"));
        assert!(cache.get("a").is_none());
        assert!(!cache.invalidate("a"));
    }

    #[test]
    fn refresh_replaces_state() {
        let cache = SessionCache::new(10);
        cache.put(CryptoboxSession::new("a", 1u32));
        let previous = cache.put(CryptoboxSession::new("a", 2u32));

        assert_eq!(previous.map(|s| s.state), Some(1));
        assert_eq!(cache.get("a").map(|s| s.state), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn huge_capacity_is_accepted() {
        let cache = SessionCache::new(usize::MAX);
        cache.put(CryptoboxSession::new("a", 1u8));
        assert_eq!(cache.get("a").map(|s| s.state), Some(1));
    }

    #[test]
    fn least_recent_session_is_evicted() {
        let cache = SessionCache::new(2);
        cache.put(CryptoboxSession::new("a", 1u32));
        cache.put(CryptoboxSession::new("b", 2u32));
        cache.get("a");

        let evicted = cache.put(CryptoboxSession::new("c", 3u32));
        assert_eq!(evicted.map(|s| s.id), Some("b".to_string()));
        assert!(cache.contains("a"));
        assert!(cache.contains("c"));
    }
}
