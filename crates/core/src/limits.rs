//! Engine-wide limits and default thresholds
//!
//! Values here are the compiled-in defaults; the configuration layer may
//! override most of them per database.

use std::time::Duration;

/// Longest accepted tag namespace, in bytes.
pub const MAX_NAMESPACE_LEN: usize = 256;

/// Longest accepted tag value, in bytes.
pub const MAX_TAG_VALUE_LEN: usize = 4096;

/// Content at or below this size is stored inline uncompressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: u64 = 4 * 1024;

/// Content at or below this size is stored inline (possibly compressed);
/// one byte over and it is chunked.
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Checkpoint after this many WAL operations.
pub const DEFAULT_CHECKPOINT_OPS: u64 = 1000;

/// Checkpoint after the WAL grows past this many bytes.
pub const DEFAULT_CHECKPOINT_BYTES: u64 = 100 * 1024 * 1024;

/// Checkpoint after this much time since the previous one.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default number of tag-index shards; must stay a power of two in 16..=256.
pub const DEFAULT_INDEX_SHARDS: usize = 64;

/// Default entity cache entry cap.
pub const DEFAULT_ENTITY_CACHE_ENTRIES: usize = 10_000;

/// Default entity cache byte cap.
pub const DEFAULT_ENTITY_CACHE_BYTES: u64 = 1024 * 1024 * 1024;

/// Default string interner entry cap.
pub const DEFAULT_STRING_CACHE_ENTRIES: usize = 100_000;

/// Default string interner byte cap.
pub const DEFAULT_STRING_CACHE_BYTES: u64 = 64 * 1024 * 1024;

/// Memory monitor sampling interval.
pub const DEFAULT_MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Fraction of the interner evicted on a pressure callback.
pub const INTERNER_PRESSURE_EVICT_FRACTION: f64 = 0.30;

/// Fraction of the entity cache evicted on a pressure callback.
pub const ENTITY_CACHE_PRESSURE_EVICT_FRACTION: f64 = 0.40;
