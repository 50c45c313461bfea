//! Temporal tag-variant cache
//!
//! A query tag can arrive in several spellings: plain (`status:open`),
//! timestamped (`1000|status:open`), or wildcard-timestamped
//! (`*|status:open`). The index is keyed by the plain form, so every query
//! expands to the variant set `{plain, "*|plain"}` and each variant is
//! normalized before the shard lookup.
//!
//! Building that set allocates, and hot tags are queried constantly, so
//! expansions are memoized in a small LRU.

use entitydb_core::tag::normalize_query_tag;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Default number of memoized variant sets.
pub const DEFAULT_VARIANT_CACHE_SIZE: usize = 1024;

/// LRU-memoized expansion of query tags to index-key variants.
pub struct TagVariantCache {
    inner: Mutex<LruCache<String, Arc<[String; 2]>>>,
}

impl TagVariantCache {
    /// Create a cache holding up to `capacity` variant sets.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        TagVariantCache {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// The variant set for a query tag: `[plain, "*|plain"]`.
    pub fn variants_for(&self, query: &str) -> Arc<[String; 2]> {
        let mut cache = self.inner.lock();
        if let Some(hit) = cache.get(query) {
            return Arc::clone(hit);
        }
        let plain = normalize_query_tag(query).to_string();
        let wildcard = format!("*|{}", plain);
        let set = Arc::new([plain, wildcard]);
        cache.put(query.to_string(), Arc::clone(&set));
        set
    }

    /// Normalize one variant back to the plain index key.
    pub fn index_key(variant: &str) -> &str {
        let stripped = variant.strip_prefix("*|").unwrap_or(variant);
        normalize_query_tag(stripped)
    }

    /// Number of memoized entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing is memoized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TagVariantCache {
    fn default() -> Self {
        TagVariantCache::new(DEFAULT_VARIANT_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_plain_query() {
        let cache = TagVariantCache::default();
        let set = cache.variants_for("status:open");
        assert_eq!(set[0], "status:open");
        assert_eq!(set[1], "*|status:open");
    }

    #[test]
    fn expands_timestamped_query_to_plain() {
        let cache = TagVariantCache::default();
        let set = cache.variants_for("1000|status:open");
        assert_eq!(set[0], "status:open");
    }

    #[test]
    fn memoizes_expansions() {
        let cache = TagVariantCache::default();
        let a = cache.variants_for("type:task");
        let b = cache.variants_for("type:task");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_past_capacity() {
        let cache = TagVariantCache::new(2);
        cache.variants_for("a:1");
        cache.variants_for("b:2");
        cache.variants_for("c:3");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn index_key_strips_wildcard_and_timestamp() {
        assert_eq!(TagVariantCache::index_key("*|status:open"), "status:open");
        assert_eq!(TagVariantCache::index_key("123|status:open"), "status:open");
        assert_eq!(TagVariantCache::index_key("status:open"), "status:open");
    }
}
