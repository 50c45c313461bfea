//! Bounded string interner
//!
//! Tag namespaces and values repeat heavily (every task carries
//! `type:task`), so the hot path interns them into shared `Arc<str>`
//! handles. The interner is an LRU bounded both by entry count and by
//! accounted bytes; a memory-pressure callback evicts the coldest fraction.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Interner counters, all monotonically increasing.
#[derive(Debug, Default)]
pub struct InternerCounters {
    /// Lookups that found an existing handle.
    pub hits: AtomicU64,
    /// Lookups that allocated a new handle.
    pub misses: AtomicU64,
    /// Entries dropped by capacity or pressure eviction.
    pub evictions: AtomicU64,
}

struct InternerInner {
    entries: LruCache<String, Arc<str>>,
    bytes: u64,
}

/// LRU map from string to interned `Arc<str>` handle.
///
/// Capped by entry count and by total interned bytes. Handles stay valid
/// after eviction — eviction only drops the interner's own reference.
pub struct StringInterner {
    inner: Mutex<InternerInner>,
    max_bytes: u64,
    counters: InternerCounters,
}

impl StringInterner {
    /// Create an interner bounded by `max_entries` and `max_bytes`.
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        StringInterner {
            inner: Mutex::new(InternerInner {
                entries: LruCache::new(cap),
                bytes: 0,
            }),
            max_bytes,
            counters: InternerCounters::default(),
        }
    }

    /// Intern a string, returning a shared handle.
    ///
    /// Reuses the existing handle when present; otherwise allocates,
    /// stores, and evicts cold entries until the byte cap holds again.
    pub fn intern(&self, s: &str) -> Arc<str> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.entries.get(s) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(handle);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let handle: Arc<str> = Arc::from(s);
        if let Some((old_key, _)) = inner
            .entries
            .push(s.to_string(), Arc::clone(&handle))
        {
            // push returns the displaced LRU entry when at capacity
            if old_key != s {
                inner.bytes = inner.bytes.saturating_sub(old_key.len() as u64);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        inner.bytes += s.len() as u64;

        while inner.bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((key, _)) => {
                    inner.bytes = inner.bytes.saturating_sub(key.len() as u64);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        handle
    }

    /// Evict the coldest `fraction` of entries.
    ///
    /// Registered as a memory-pressure callback; must return quickly and
    /// holds only the interner's own lock.
    pub fn evict_fraction(&self, fraction: f64) {
        let mut inner = self.inner.lock();
        let to_evict = ((inner.entries.len() as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize;
        for _ in 0..to_evict {
            match inner.entries.pop_lru() {
                Some((key, _)) => {
                    inner.bytes = inner.bytes.saturating_sub(key.len() as u64);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
        if to_evict > 0 {
            debug!(evicted = to_evict, "interner pressure eviction");
        }
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when nothing is interned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accounted interned bytes.
    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    /// Counter access for external collectors.
    pub fn counters(&self) -> &InternerCounters {
        &self.counters
    }
}
