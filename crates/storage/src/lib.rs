//! In-memory storage layer for EntityDB
//!
//! This crate implements the concurrent in-memory side of the engine:
//! - `ShardedTagIndex`: tag → entity-id index, power-of-two sharded,
//!   per-shard reader-writer locks, incremental updates only
//! - `TagVariantCache`: LRU-memoized expansion of query tags to index keys
//! - `StringInterner`: bounded LRU interner with byte accounting
//! - `EntityCache`: byte-accounted LRU of recently read entities with
//!   surgical invalidation
//! - `EntityStore`: DashMap of entities mutated since the last checkpoint
//!
//! Everything durable lives in the `entitydb-durability` crate; this crate
//! is rebuildable state and read acceleration.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod interner;
pub mod sharded;
pub mod store;
pub mod variants;

pub use cache::{CacheCounters, EntityCache};
pub use interner::{InternerCounters, StringInterner};
pub use sharded::{ShardedTagIndex, MAX_SHARDS, MIN_SHARDS};
pub use store::{DirtyEntry, EntityStore};
pub use variants::{TagVariantCache, DEFAULT_VARIANT_CACHE_SIZE};
