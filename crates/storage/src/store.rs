//! In-memory dirty entity store
//!
//! Holds every entity mutated since the last checkpoint, plus tombstones
//! for deletions. Reads consult this store before falling back to the
//! memory-mapped data section; the checkpoint drains it into a fresh data
//! section and clears it.
//!
//! Backed by a DashMap: reads are lock-free, writes lock only the touched
//! DashMap shard, and different entities never contend.

use dashmap::DashMap;
use entitydb_core::{Entity, EntityId};
use std::sync::Arc;

/// A dirty-store slot: a pending write or a pending deletion.
#[derive(Debug, Clone)]
pub enum DirtyEntry {
    /// Entity written (created or mutated) since the last checkpoint.
    Written(Arc<Entity>),
    /// Entity deleted since the last checkpoint; the data-section record is
    /// reclaimed at the next checkpoint.
    Tombstone,
}

/// Map of entities mutated since the last checkpoint.
#[derive(Debug, Default)]
pub struct EntityStore {
    entries: DashMap<EntityId, DirtyEntry>,
}

impl EntityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        EntityStore {
            entries: DashMap::new(),
        }
    }

    /// Record a written entity, replacing any prior dirty state.
    pub fn put(&self, entity: Arc<Entity>) {
        self.entries.insert(entity.id, DirtyEntry::Written(entity));
    }

    /// Record a deletion.
    pub fn tombstone(&self, id: EntityId) {
        self.entries.insert(id, DirtyEntry::Tombstone);
    }

    /// Dirty state for an entity, if any.
    ///
    /// `Some(Written)` means the store has the freshest copy;
    /// `Some(Tombstone)` means the entity is deleted regardless of what the
    /// data section says; `None` means the data section is authoritative.
    pub fn get(&self, id: &EntityId) -> Option<DirtyEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// True when the entity has dirty state.
    pub fn contains(&self, id: &EntityId) -> bool {
        self.entries.contains_key(id)
    }

    /// Snapshot of all dirty entries, for the checkpoint writer.
    pub fn drain_snapshot(&self) -> Vec<(EntityId, DirtyEntry)> {
        self.entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Ids of all written (non-tombstone) dirty entities.
    pub fn written_ids(&self) -> Vec<EntityId> {
        self.entries
            .iter()
            .filter(|e| matches!(e.value(), DirtyEntry::Written(_)))
            .map(|e| *e.key())
            .collect()
    }

    /// Ids of all tombstoned entities.
    pub fn tombstoned_ids(&self) -> Vec<EntityId> {
        self.entries
            .iter()
            .filter(|e| matches!(e.value(), DirtyEntry::Tombstone))
            .map(|e| *e.key())
            .collect()
    }

    /// Number of dirty entries (written + tombstoned).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is dirty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear after a successful checkpoint.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitydb_core::{Content, TemporalTag, Timestamp};

    fn entity() -> Arc<Entity> {
        Arc::new(
            Entity::new(
                EntityId::generate(),
                vec![TemporalTag::new(Timestamp::from_nanos(1), "type", "task")],
                Content::Empty,
            )
            .unwrap(),
        )
    }

    #[test]
    fn put_get_round_trip() {
        let store = EntityStore::new();
        let e = entity();
        store.put(Arc::clone(&e));
        match store.get(&e.id) {
            Some(DirtyEntry::Written(found)) => assert_eq!(found.id, e.id),
            other => panic!("expected written entry, got {:?}", other),
        }
    }

    #[test]
    fn tombstone_overrides_write() {
        let store = EntityStore::new();
        let e = entity();
        store.put(Arc::clone(&e));
        store.tombstone(e.id);
        assert!(matches!(store.get(&e.id), Some(DirtyEntry::Tombstone)));
        assert_eq!(store.tombstoned_ids(), vec![e.id]);
        assert!(store.written_ids().is_empty());
    }

    #[test]
    fn write_after_tombstone_revives() {
        let store = EntityStore::new();
        let e = entity();
        store.tombstone(e.id);
        store.put(Arc::clone(&e));
        assert!(matches!(store.get(&e.id), Some(DirtyEntry::Written(_))));
    }

    #[test]
    fn clear_empties_store() {
        let store = EntityStore::new();
        store.put(entity());
        store.tombstone(EntityId::generate());
        assert_eq!(store.len(), 2);
        store.clear();
        assert!(store.is_empty());
        assert!(store.drain_snapshot().is_empty());
    }
}
