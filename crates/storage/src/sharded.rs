//! Sharded tag index
//!
//! Maps plain tags (`namespace:value`) to sets of entity ids. The index is
//! split into a fixed power-of-two number of shards selected by a stable
//! hash of the tag string; each shard owns its own reader-writer lock and
//! map, so writers touching different tags never contend.
//!
//! # Design
//!
//! - Per-shard `RwLock<FxHashMap<String, FxHashSet<EntityId>>>`
//! - Stable FxHash shard selection (deterministic across restarts)
//! - Incremental updates: only the shards of changed tags are write-locked
//! - Wildcard lookups fan out across shards and return a deduplicated union
//!
//! The index is an accelerator, not a source of truth: it is fully
//! rebuildable from the data section, and the on-disk snapshot exists only
//! for warm starts.

use entitydb_core::{Error, EntityId, Result};
use parking_lot::RwLock;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use std::hash::Hasher;

/// Smallest permitted shard count.
pub const MIN_SHARDS: usize = 16;
/// Largest permitted shard count.
pub const MAX_SHARDS: usize = 256;

type ShardMap = FxHashMap<String, FxHashSet<EntityId>>;

/// One shard of the tag index.
#[derive(Debug, Default)]
struct Shard {
    tags: ShardMap,
}

/// Tag → entity-id index, sharded for concurrent access.
pub struct ShardedTagIndex {
    shards: Vec<RwLock<Shard>>,
    mask: usize,
}

impl ShardedTagIndex {
    /// Create an index with the given shard count.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` unless `shard_count` is a power of two in
    /// `16..=256`.
    pub fn new(shard_count: usize) -> Result<Self> {
        if !shard_count.is_power_of_two()
            || !(MIN_SHARDS..=MAX_SHARDS).contains(&shard_count)
        {
            return Err(Error::invalid_input(format!(
                "index shard count must be a power of two in {}..={}, got {}",
                MIN_SHARDS, MAX_SHARDS, shard_count
            )));
        }
        let shards = (0..shard_count)
            .map(|_| RwLock::new(Shard::default()))
            .collect();
        Ok(ShardedTagIndex {
            shards,
            mask: shard_count - 1,
        })
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Stable shard selection by tag string.
    fn shard_for(&self, tag: &str) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write(tag.as_bytes());
        (hasher.finish() as usize) & self.mask
    }

    /// Add one entity id under one plain tag.
    ///
    /// Returns `true` when the pairing was not already present. Only the
    /// tag's own shard is write-locked.
    pub fn insert(&self, tag: &str, id: EntityId) -> bool {
        let mut shard = self.shards[self.shard_for(tag)].write();
        shard.tags.entry(tag.to_string()).or_default().insert(id)
    }

    /// Remove one entity id from one plain tag.
    ///
    /// Drops the tag entry entirely when its id set empties out.
    pub fn remove(&self, tag: &str, id: &EntityId) -> bool {
        let mut shard = self.shards[self.shard_for(tag)].write();
        if let Some(ids) = shard.tags.get_mut(tag) {
            let removed = ids.remove(id);
            if ids.is_empty() {
                shard.tags.remove(tag);
            }
            removed
        } else {
            false
        }
    }

    /// Index every distinct plain tag of a new or mutated entity.
    ///
    /// Shards are touched one at a time in tag order; no global lock is
    /// taken.
    pub fn add_entity<'a>(&self, id: EntityId, plain_tags: impl Iterator<Item = &'a str>) {
        for tag in plain_tags {
            self.insert(tag, id);
        }
    }

    /// Remove an entity's plain tags from the index.
    pub fn remove_entity<'a>(&self, id: &EntityId, plain_tags: impl Iterator<Item = &'a str>) {
        for tag in plain_tags {
            self.remove(tag, id);
        }
    }

    /// Exact lookup of one plain tag.
    pub fn lookup(&self, tag: &str) -> Vec<EntityId> {
        let shard = self.shards[self.shard_for(tag)].read();
        match shard.tags.get(tag) {
            Some(ids) => {
                let mut out: Vec<EntityId> = ids.iter().copied().collect();
                out.sort_unstable();
                out
            }
            None => Vec::new(),
        }
    }

    /// True when any entity carries the tag.
    pub fn contains(&self, tag: &str) -> bool {
        let shard = self.shards[self.shard_for(tag)].read();
        shard.tags.contains_key(tag)
    }

    /// Prefix lookup (`rbac:perm:entity:*` with the `*` stripped by the
    /// caller). Shards are scanned in parallel and the results unioned and
    /// deduplicated.
    pub fn lookup_prefix(&self, prefix: &str) -> Vec<EntityId> {
        let seen = self
            .shards
            .par_iter()
            .map(|shard| {
                let shard = shard.read();
                let mut hits: FxHashSet<EntityId> = FxHashSet::default();
                for (tag, ids) in &shard.tags {
                    if tag.starts_with(prefix) {
                        hits.extend(ids.iter().copied());
                    }
                }
                hits
            })
            .reduce(FxHashSet::default, |mut a, b| {
                a.extend(b);
                a
            });
        let mut out: Vec<EntityId> = seen.into_iter().collect();
        out.sort_unstable();
        out
    }

    /// Total number of indexed tag entries across all shards.
    pub fn tag_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().tags.len()).sum()
    }

    /// All distinct entity ids currently indexed.
    ///
    /// Every live entity carries at least its mandatory tags, so this set
    /// is exactly the live-entity population. Used by the checkpoint to
    /// rederive the header entity count.
    pub fn distinct_entities(&self) -> FxHashSet<EntityId> {
        let mut all = FxHashSet::default();
        for shard in &self.shards {
            let shard = shard.read();
            for ids in shard.tags.values() {
                all.extend(ids.iter().copied());
            }
        }
        all
    }

    /// Number of distinct entities in the index.
    pub fn entity_count(&self) -> usize {
        self.distinct_entities().len()
    }

    /// Per-shard snapshot for serialization into the unified file's index
    /// section. Tags within each shard are sorted so snapshots are
    /// byte-deterministic.
    pub fn snapshot(&self) -> Vec<Vec<(String, Vec<EntityId>)>> {
        self.shards
            .iter()
            .map(|shard| {
                let shard = shard.read();
                let mut entries: Vec<(String, Vec<EntityId>)> = shard
                    .tags
                    .iter()
                    .map(|(tag, ids)| {
                        let mut ids: Vec<EntityId> = ids.iter().copied().collect();
                        ids.sort_unstable();
                        (tag.clone(), ids)
                    })
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries
            })
            .collect()
    }

    /// Warm-start the index from a deserialized snapshot.
    ///
    /// Entries are re-hashed rather than trusting the snapshot's shard
    /// assignment, so a changed shard count still loads correctly.
    pub fn load(&self, snapshot: Vec<Vec<(String, Vec<EntityId>)>>) {
        self.clear();
        for shard_entries in snapshot {
            for (tag, ids) in shard_entries {
                let mut shard = self.shards[self.shard_for(&tag)].write();
                shard.tags.entry(tag).or_default().extend(ids);
            }
        }
    }

    /// Drop every entry. Startup/rebuild only — never on the hot path.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().tags.clear();
        }
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().tags.is_empty())
    }
}

impl std::fmt::Debug for ShardedTagIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedTagIndex")
            .field("shards", &self.shards.len())
            .field("tags", &self.tag_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> ShardedTagIndex {
        ShardedTagIndex::new(16).unwrap()
    }

    #[test]
    fn shard_count_validation() {
        assert!(ShardedTagIndex::new(16).is_ok());
        assert!(ShardedTagIndex::new(256).is_ok());
        assert!(ShardedTagIndex::new(8).is_err());
        assert!(ShardedTagIndex::new(512).is_err());
        assert!(ShardedTagIndex::new(48).is_err());
    }

    #[test]
    fn insert_lookup_remove() {
        let idx = index();
        let a = EntityId::generate();
        let b = EntityId::generate();

        assert!(idx.insert("status:open", a));
        assert!(!idx.insert("status:open", a));
        assert!(idx.insert("status:open", b));

        let hits = idx.lookup("status:open");
        assert_eq!(hits.len(), 2);
        assert!(hits.contains(&a) && hits.contains(&b));

        assert!(idx.remove("status:open", &a));
        assert!(!idx.remove("status:open", &a));
        assert_eq!(idx.lookup("status:open"), vec![b]);

        idx.remove("status:open", &b);
        assert!(!idx.contains("status:open"));
        assert!(idx.is_empty());
    }

    #[test]
    fn shard_selection_is_stable() {
        let idx = index();
        let first = idx.shard_for("type:task");
        for _ in 0..100 {
            assert_eq!(idx.shard_for("type:task"), first);
        }
    }

    #[test]
    fn prefix_lookup_unions_and_dedups() {
        let idx = index();
        let a = EntityId::generate();
        let b = EntityId::generate();

        idx.insert("rbac:perm:entity:view", a);
        idx.insert("rbac:perm:entity:edit", a);
        idx.insert("rbac:perm:entity:edit", b);
        idx.insert("rbac:role:admin", b);

        let hits = idx.lookup_prefix("rbac:perm:entity:");
        assert_eq!(hits.len(), 2);

        assert_eq!(idx.lookup_prefix("rbac:role:"), vec![b]);
    }

    #[test]
    fn entity_count_tracks_distinct_ids() {
        let idx = index();
        let a = EntityId::generate();
        let b = EntityId::generate();

        idx.add_entity(a, ["type:task", "dataset:ops", "status:open"].into_iter());
        idx.add_entity(b, ["type:task", "dataset:ops"].into_iter());

        assert_eq!(idx.entity_count(), 2);
        assert_eq!(idx.lookup("type:task").len(), 2);

        idx.remove_entity(&a, ["type:task", "dataset:ops", "status:open"].into_iter());
        assert_eq!(idx.entity_count(), 1);
    }

    #[test]
    fn snapshot_load_round_trip() {
        let idx = index();
        let ids: Vec<EntityId> = (0..20).map(|_| EntityId::generate()).collect();
        for (i, id) in ids.iter().enumerate() {
            idx.insert(&format!("type:kind{}", i % 3), *id);
            idx.insert("dataset:ops", *id);
        }

        let snapshot = idx.snapshot();
        let restored = ShardedTagIndex::new(16).unwrap();
        restored.load(snapshot);

        assert_eq!(restored.tag_count(), idx.tag_count());
        assert_eq!(restored.entity_count(), 20);
        assert_eq!(restored.lookup("dataset:ops").len(), 20);
    }

    #[test]
    fn load_rehashes_into_different_shard_count() {
        let idx = index();
        let id = EntityId::generate();
        idx.insert("type:task", id);

        let bigger = ShardedTagIndex::new(64).unwrap();
        bigger.load(idx.snapshot());
        assert_eq!(bigger.lookup("type:task"), vec![id]);
    }

    #[test]
    fn snapshot_is_deterministic() {
        let idx = index();
        let a = EntityId::generate();
        idx.insert("b:2", a);
        idx.insert("a:1", a);
        assert_eq!(idx.snapshot(), idx.snapshot());
    }
}
