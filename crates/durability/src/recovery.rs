//! Recovery manager
//!
//! Engaged when an entity lookup misses everywhere. Recovery is pattern-
//! based and selective: the metrics subsystem historically probed for
//! 32-character hex identifiers that never existed, and recovering each of
//! those burned CPU for nothing. The decision rule:
//!
//! - the reserved system user id → always recover
//! - 32 chars, pure hex → skip (transient metric artifact), fail fast
//! - 32 chars, mixed alphanumerics → attempt (likely a real identifier)
//!
//! When engaged, strategies run in order: scoped WAL replay, index
//! re-derivation from a found record, exhaustive data-section scan, and —
//! for the system user only, in permissive mode — placeholder synthesis.

use crate::reader::MappedReader;
use crate::wal::reader::{WalReadResult, WalReader};
use entitydb_core::{namespaces, Content, Entity, EntityId, TemporalTag, Timestamp};
use entitydb_storage::ShardedTagIndex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::format::wal_record::WalPayload;

/// What the decision rule says to do for a missing id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Reserved system entity; recovery always runs.
    Always,
    /// Likely metric artifact; return not-found promptly.
    Skip,
    /// Likely real identifier; run the strategy ladder.
    Attempt,
}

/// How far the strategy ladder may go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicyMode {
    /// Never synthesize placeholders.
    Strict,
    /// Placeholders allowed for critical system entities.
    #[default]
    Permissive,
}

/// How a recovered entity was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySource {
    /// Rebuilt by replaying the entity's WAL records.
    WalReplay,
    /// Found in the data section; its index entries were re-derived.
    IndexRederived,
    /// Found by the exhaustive data-section scan.
    FileScan,
    /// Synthesized placeholder needing administrator attention.
    Placeholder,
}

/// Recovery counters, all monotonically increasing.
#[derive(Debug, Default)]
pub struct RecoveryCounters {
    /// Ladders started.
    pub attempts: AtomicU64,
    /// Lookups skipped by the hex-artifact rule.
    pub skips: AtomicU64,
    /// Entities recovered (any strategy).
    pub recovered: AtomicU64,
    /// Placeholders synthesized.
    pub placeholders: AtomicU64,
    /// Ladders that found nothing.
    pub failures: AtomicU64,
}

/// Pattern-based, selective recovery.
pub struct RecoveryManager {
    mode: RecoveryPolicyMode,
    counters: RecoveryCounters,
}

impl RecoveryManager {
    /// Create a manager with the given policy mode.
    pub fn new(mode: RecoveryPolicyMode) -> Self {
        RecoveryManager {
            mode,
            counters: RecoveryCounters::default(),
        }
    }

    /// Apply the decision rule to a missing id.
    ///
    /// Counts skips; `attempt` counts ladder starts itself, so deciding
    /// without engaging is free.
    pub fn decide(&self, id: &EntityId) -> RecoveryDecision {
        if id.is_system_user() {
            RecoveryDecision::Always
        } else if id.is_pure_hex() {
            self.counters.skips.fetch_add(1, Ordering::Relaxed);
            debug!(id = %id, "skipping recovery for pure-hex id");
            RecoveryDecision::Skip
        } else {
            RecoveryDecision::Attempt
        }
    }

    /// Run the strategy ladder for a missing entity.
    ///
    /// `wal` is the replayed WAL of the current file; `reader` the mapped
    /// data section; `index` the live tag index (repaired in place when a
    /// record is found that the index lost).
    pub fn attempt(
        &self,
        id: &EntityId,
        wal: &WalReadResult,
        reader: &MappedReader,
        index: &ShardedTagIndex,
    ) -> Option<(Entity, RecoverySource)> {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

        // 1. Scoped WAL replay
        if let Some(entity) = replay_entity(wal, id) {
            info!(id = %id, "recovered entity from WAL replay");
            self.repair_index(index, &entity);
            self.counters.recovered.fetch_add(1, Ordering::Relaxed);
            return Some((entity, RecoverySource::WalReplay));
        }

        // 2. Record present but index lost it: re-derive the tag entries
        if let Ok(Some(entity)) = reader.get(id) {
            info!(id = %id, "recovered entity from data section; re-deriving index entries");
            self.repair_index(index, &entity);
            self.counters.recovered.fetch_add(1, Ordering::Relaxed);
            return Some((entity, RecoverySource::IndexRederived));
        }

        // 3. Exhaustive scan, in case the offset index itself is damaged
        if let Some(entity) = reader.scan_for(id) {
            info!(id = %id, "recovered entity by data-section scan");
            self.repair_index(index, &entity);
            self.counters.recovered.fetch_add(1, Ordering::Relaxed);
            return Some((entity, RecoverySource::FileScan));
        }

        // 4. Placeholder, critical system entities only
        if id.is_system_user() && self.mode == RecoveryPolicyMode::Permissive {
            warn!(id = %id, "synthesizing placeholder for missing system entity");
            let entity = placeholder_entity(*id);
            self.repair_index(index, &entity);
            self.counters.placeholders.fetch_add(1, Ordering::Relaxed);
            return Some((entity, RecoverySource::Placeholder));
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn repair_index(&self, index: &ShardedTagIndex, entity: &Entity) {
        for tag in &entity.tags {
            index.insert(&tag.plain(), entity.id);
        }
    }

    /// Counter access for external collectors.
    pub fn counters(&self) -> &RecoveryCounters {
        &self.counters
    }

    /// The configured policy mode.
    pub fn mode(&self) -> RecoveryPolicyMode {
        self.mode
    }
}

/// Rebuild an entity's state from its WAL records alone.
fn replay_entity(wal: &WalReadResult, id: &EntityId) -> Option<Entity> {
    let records = WalReader::records_for(wal, id);
    let mut entity: Option<Entity> = None;
    for record in records {
        match record.payload {
            WalPayload::Create { tags, content } | WalPayload::Update { tags, content } => {
                entity = Entity::new(*id, tags, content).ok();
            }
            WalPayload::AddTag { tag } => {
                if let Some(e) = entity.as_mut() {
                    let _ = e.append_tag(tag);
                }
            }
            WalPayload::Delete => {
                entity = None;
            }
        }
    }
    entity
}

/// Minimal placeholder marked for administrator attention.
fn placeholder_entity(id: EntityId) -> Entity {
    let now = Timestamp::now();
    Entity::new(
        id,
        vec![
            TemporalTag::new(now, namespaces::TYPE, "system"),
            TemporalTag::new(now, namespaces::DATASET, "system"),
            TemporalTag::new(now, namespaces::CREATED_BY, "recovery"),
            TemporalTag::new(now, namespaces::STATUS, "placeholder"),
        ],
        Content::Empty,
    )
    .expect("placeholder construction is infallible")
}
