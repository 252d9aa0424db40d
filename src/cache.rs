//! Bounded, thread-safe LRU cache from block content hash to rendered HTML.
//!
//! Recency is bumped on every `get` hit and every `put`. When an insert would
//! exceed capacity, the least recently used entry is evicted first. The map is
//! guarded by a single mutex; lookups and inserts are short compared to a
//! render call, so contention stays low even with a full worker pool.

use crate::hash::ContentHash;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("block cache capacity must be at least 1")]
    ZeroCapacity,
}

pub struct BlockCache {
    entries: Mutex<LruCache<ContentHash, Arc<str>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

impl BlockCache {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(CacheError::ZeroCapacity)?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn get(&self, hash: &ContentHash) -> Option<Arc<str>> {
        let found = self.entries.lock().get(hash).cloned();
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Lookup without touching recency or the hit/miss counters.
    pub fn peek(&self, hash: &ContentHash) -> Option<Arc<str>> {
        self.entries.lock().peek(hash).cloned()
    }

    pub fn put(&self, hash: ContentHash, html: Arc<str>) {
        let evicted = self.entries.lock().push(hash, html);
        if let Some((old, _)) = evicted {
            if old != hash {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(target: "adocview::cache", hash = %old.short(), "evicted");
            }
        }
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        let dropped = entries.len();
        entries.clear();
        tracing::debug!(target: "adocview::cache", dropped, "cache cleared");
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.entries.lock().contains(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn stats(&self) -> CacheStats {
        let (len, capacity) = {
            let entries = self.entries.lock();
            (entries.len(), entries.cap().get())
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len,
            capacity,
        }
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache").field("stats", &self.stats()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockCache, CacheError};
    use crate::hash::ContentHash;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn h(s: &str) -> ContentHash {
        ContentHash::of(s)
    }

    fn html(s: &str) -> Arc<str> {
        Arc::from(format!("<p>{s}</p>"))
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(BlockCache::new(0).err(), Some(CacheError::ZeroCapacity));
    }

    #[test]
    fn miss_then_hit() {
        let cache = BlockCache::new(4).unwrap();
        assert!(cache.get(&h("a")).is_none());
        cache.put(h("a"), html("a"));
        assert_eq!(cache.get(&h("a")).as_deref(), Some("<p>a</p>"));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.len), (1, 1, 1));
    }

    #[test]
    fn oldest_entry_is_evicted() {
        let cache = BlockCache::new(2).unwrap();
        cache.put(h("A"), html("A"));
        cache.put(h("B"), html("B"));
        cache.put(h("C"), html("C"));
        assert!(!cache.contains(&h("A")));
        assert!(cache.contains(&h("B")));
        assert!(cache.contains(&h("C")));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn get_protects_entry_from_eviction() {
        let cache = BlockCache::new(2).unwrap();
        cache.put(h("A"), html("A"));
        cache.put(h("B"), html("B"));
        assert!(cache.get(&h("A")).is_some());
        cache.put(h("C"), html("C"));
        assert!(cache.contains(&h("A")));
        assert!(!cache.contains(&h("B")));
        assert!(cache.contains(&h("C")));
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let cache = BlockCache::new(2).unwrap();
        cache.put(h("A"), html("old"));
        cache.put(h("A"), html("new"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(&h("A")).as_deref(), Some("<p>new</p>"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn clear_empties_cache() {
        let cache = BlockCache::new(3).unwrap();
        cache.put(h("A"), html("A"));
        cache.put(h("B"), html("B"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 3);
    }

    #[test]
    fn concurrent_puts_respect_capacity() {
        let cache = Arc::new(BlockCache::new(16).unwrap());
        thread::scope(|s| {
            for t in 0..8 {
                let cache = Arc::clone(&cache);
                s.spawn(move || {
                    for i in 0..200 {
                        let key = format!("{t}-{i}");
                        cache.put(h(&key), html(&key));
                        let _ = cache.get(&h(&key));
                    }
                });
            }
        });
        assert_eq!(cache.len(), 16);
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(
            cap in 1usize..8,
            keys in prop::collection::vec(0u8..32, 0..100),
        ) {
            let cache = BlockCache::new(cap).unwrap();
            for k in keys {
                let key = k.to_string();
                if k % 3 == 0 {
                    let _ = cache.get(&h(&key));
                }
                cache.put(h(&key), html(&key));
                prop_assert!(cache.len() <= cap);
            }
        }
    }
}
