//! Bounded entity cache
//!
//! LRU of recently read entities with per-entry byte accounting. The cache
//! is a read-through view over durable state: it never holds the only copy
//! of a write, and invalidation is always surgical — one entity id at a
//! time. There is deliberately no `clear()` on the hot-path API.

use entitydb_core::{Entity, EntityId};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Cache counters, all monotonically increasing.
#[derive(Debug, Default)]
pub struct CacheCounters {
    /// Reads served from the cache.
    pub hits: AtomicU64,
    /// Reads that fell through to storage.
    pub misses: AtomicU64,
    /// Entries dropped by capacity or pressure eviction.
    pub evictions: AtomicU64,
    /// Surgical invalidations.
    pub invalidations: AtomicU64,
}

impl CacheCounters {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
            self.invalidations.load(Ordering::Relaxed),
        )
    }
}

struct CacheInner {
    entries: LruCache<EntityId, Arc<Entity>>,
    bytes: u64,
}

/// Byte-accounted LRU cache of entities.
pub struct EntityCache {
    inner: Mutex<CacheInner>,
    max_bytes: u64,
    counters: CacheCounters,
}

impl EntityCache {
    /// Create a cache bounded by `max_entries` and `max_bytes`.
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        EntityCache {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(cap),
                bytes: 0,
            }),
            max_bytes,
            counters: CacheCounters::default(),
        }
    }

    /// Look up an entity, refreshing its recency on hit.
    pub fn get(&self, id: &EntityId) -> Option<Arc<Entity>> {
        let mut inner = self.inner.lock();
        match inner.entries.get(id) {
            Some(entity) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(entity))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace an entity.
    pub fn insert(&self, entity: Arc<Entity>) {
        let size = entity.heap_size() as u64;
        let mut inner = self.inner.lock();

        if let Some(old) = inner.entries.pop(&entity.id) {
            inner.bytes = inner.bytes.saturating_sub(old.heap_size() as u64);
        }
        if let Some((_, displaced)) = inner.entries.push(entity.id, entity) {
            inner.bytes = inner.bytes.saturating_sub(displaced.heap_size() as u64);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        inner.bytes += size;

        while inner.bytes > self.max_bytes && inner.entries.len() > 0 {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.bytes = inner.bytes.saturating_sub(evicted.heap_size() as u64);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    /// Drop one entity. The only invalidation the write path is allowed to
    /// use.
    pub fn invalidate(&self, id: &EntityId) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(id) {
            inner.bytes = inner.bytes.saturating_sub(old.heap_size() as u64);
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evict the coldest `fraction` of entries.
    ///
    /// Registered as a memory-pressure callback; must return quickly and
    /// holds only the cache's own lock.
    pub fn evict_fraction(&self, fraction: f64) {
        let mut inner = self.inner.lock();
        let to_evict = ((inner.entries.len() as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize;
        for _ in 0..to_evict {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.bytes = inner.bytes.saturating_sub(evicted.heap_size() as u64);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
        if to_evict > 0 {
            debug!(evicted = to_evict, "entity cache pressure eviction");
        }
    }

    /// Number of cached entities.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accounted cached bytes.
    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    /// Counter access for external collectors.
    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }
}
