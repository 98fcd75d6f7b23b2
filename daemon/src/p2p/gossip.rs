use lru::LruCache;
use std::num::NonZeroUsize;
use tessera_common::crypto::Hash;
use tokio::sync::Mutex;

/// Deduplication for rebroadcast messages: a bounded LRU over
/// `(origin_id, message_id)` fingerprints. The first sighting of a
/// fingerprint wins; every later copy is dropped at the application
/// layer no matter which peer relayed it.
pub struct GossipTracker {
    seen: Mutex<LruCache<(String, Hash), ()>>,
}

impl GossipTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1"),
            )),
        }
    }

    /// Returns true exactly once per fingerprint and records it.
    pub async fn should_process(&self, origin: &str, id: &Hash) -> bool {
        let mut seen = self.seen.lock().await;
        let key = (origin.to_owned(), id.clone());
        if seen.contains(&key) {
            return false;
        }
        seen.put(key, ());
        true
    }

    /// Record a fingerprint without asking, used for messages we
    /// originate ourselves so echoes are dropped.
    pub async fn mark_seen(&self, origin: &str, id: &Hash) {
        self.seen.lock().await.put((origin.to_owned(), id.clone()), ());
    }
}
