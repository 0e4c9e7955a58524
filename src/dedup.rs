//! Signaling dedup cache.
//!
//! Relays fan every signal out along multiple paths, so the session manager
//! sees the same payload more than once. A small bounded cache keyed on the
//! raw payload bytes drops the copies. Lookups deliberately do not refresh
//! recency: a payload is deduplicated against the last N distinct arrivals,
//! not against whatever was touched most recently.

use std::num::NonZeroUsize;

use lru::LruCache;

/// Number of distinct payloads remembered for deduplication.
pub const DEDUP_CAPACITY: usize = 100;

type EvictionHook = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Bounded insertion-ordered presence cache over raw payload bytes.
pub struct DedupCache {
    entries: LruCache<Vec<u8>, bool>,
    on_evict: Option<EvictionHook>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("dedup capacity must be non-zero");
        Self {
            entries: LruCache::new(capacity),
            on_evict: None,
        }
    }

    /// Like [`DedupCache::new`], with a hook invoked with each evicted key.
    pub fn with_eviction_hook(capacity: usize, hook: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        let mut cache = Self::new(capacity);
        cache.on_evict = Some(Box::new(hook));
        cache
    }

    /// Presence check. Does not refresh the entry's recency.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains(key)
    }

    /// Record a payload. An existing entry is refreshed; otherwise the
    /// least-recently-added entry is evicted once the cache is full.
    pub fn insert(&mut self, key: &[u8]) {
        if let Some((evicted, _)) = self.entries.push(key.to_vec(), true) {
            if evicted != key {
                if let Some(hook) = &self.on_evict {
                    hook(&evicted);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("len", &self.entries.len())
            .field("cap", &self.entries.cap())
            .finish()
    }
}
