//! Entity repository
//!
//! The façade every caller goes through. A write travels: WAL append →
//! in-memory entity and index update → surgical cache invalidation →
//! in-line retention pass → deferred checkpoint. A read travels: cache →
//! dirty store → mmap, falling into selective recovery on a total miss.
//!
//! # Lock discipline
//!
//! - per-entity mutex around every read-modify-write
//! - per-shard locks inside the tag index, touched only for changed tags
//! - a write gate (shared for writers, exclusive for checkpoint) so a
//!   checkpoint never observes a WAL record whose in-memory effect hasn't
//!   landed
//! - the checkpoint lock serializes checkpoints themselves
//!
//! Writers to different entities proceed in parallel; writers to the same
//! entity serialize on its lock; readers never block writers.

use crate::config::EngineConfig;
use crate::metrics::{
    metric_entity_id, set_metrics_globally_enabled, RepositoryCounters, WriteDepthGuard,
};
use crate::memory::{MemoryMonitor, PressureLevel, PressureThresholds};
use crate::retention::RetentionManager;
use crate::selector::Selector;
use crate::temporal::{self, AsOfView, EntityChanges, TagDiff};
use dashmap::DashMap;
use entitydb_core::{
    limits, namespaces, Content, Entity, EntityId, Error, Result, SystemClock, TemporalTag,
    Timestamp,
};
use entitydb_core::entity::MANDATORY_NAMESPACES;
use entitydb_core::tag::CHUNK_ENTITY_TYPE;
use entitydb_core::Clock;
use entitydb_durability::{
    write_checkpoint, CheckpointTriggers, MappedReader, RecoveryDecision, RecoveryManager,
    UnifiedFile, WalPayload, WalReader, WalWriter,
};
use entitydb_storage::{
    DirtyEntry, EntityCache, EntityStore, ShardedTagIndex, StringInterner, TagVariantCache,
};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Lightweight entity listing row: foundational tags without content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySummary {
    /// Entity id.
    pub id: EntityId,
    /// Latest `type:` value.
    pub entity_type: Option<String>,
    /// Latest `dataset:` value.
    pub dataset: Option<String>,
    /// Latest tag timestamp.
    pub updated_at: Timestamp,
}

/// The storage engine façade.
pub struct EntityRepository {
    config: EngineConfig,
    clock: Arc<dyn Clock>,

    unified: Mutex<UnifiedFile>,
    wal: WalWriter,
    reader: RwLock<Arc<MappedReader>>,

    store: EntityStore,
    index: ShardedTagIndex,
    variants: TagVariantCache,
    cache: Arc<EntityCache>,
    interner: Arc<StringInterner>,

    locks: DashMap<EntityId, Arc<Mutex<()>>>,
    /// Shared by writers, exclusive for checkpoint.
    write_gate: RwLock<()>,
    checkpoint_lock: Mutex<()>,
    last_checkpoint: Mutex<Instant>,
    triggers: CheckpointTriggers,

    retention: RetentionManager,
    recovery: RecoveryManager,
    monitor: Mutex<Option<MemoryMonitor>>,
    counters: RepositoryCounters,
    closed: AtomicBool,
}

impl EntityRepository {
    /// Open (or create) the database described by `config`.
    pub fn open(config: EngineConfig) -> Result<Arc<Self>> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open with a caller-supplied clock. Timestamps still get per-entity
    /// monotonicity enforced on top of whatever the clock returns.
    pub fn open_with_clock(mut config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        config.validate()?;
        let (mut unified, created) = UnifiedFile::open_or_create(&config.database_file)?;

        let index = ShardedTagIndex::new(config.index_shard_count)?;
        let reader = MappedReader::map(&unified.try_clone()?, unified.header())?;

        // Warm-start the tag index from the index section; rebuild from the
        // data section when the snapshot is missing or damaged
        let mut need_rebuild = !created && unified.header().index_length == 0;
        if unified.header().index_length > 0 {
            match unified
                .read_index_section()
                .and_then(|bytes| entitydb_durability::decode_index(&bytes))
            {
                Ok(snapshot) => index.load(snapshot),
                Err(e) => {
                    warn!(error = %e, "index section unusable; rebuilding from data section");
                    need_rebuild = true;
                }
            }
        }
        if need_rebuild || reader.migrated_count() > 0 {
            index.clear();
            let (entities, corrupt) = reader.iter_entities();
            for entity in &entities {
                for tag in &entity.tags {
                    index.insert(&tag.plain(), entity.id);
                }
            }
            if corrupt > 0 {
                warn!(corrupt, "index rebuild skipped corrupt records");
            }
        }

        // Replay the WAL into the dirty store
        let store = EntityStore::new();
        let wal_start = unified.wal_start();
        let mut wal_file = unified.try_clone()?;
        let replay = WalReader::read_from_file(&mut wal_file, wal_start)?;
        if replay.skipped > 0 || replay.truncated {
            warn!(
                skipped = replay.skipped,
                truncated = replay.truncated,
                "WAL replay encountered damage"
            );
        }
        let next_seq = replay.max_seq().map(|s| s + 1).unwrap_or(1);
        for record in &replay.records {
            apply_replayed(&store, &index, &reader, record);
        }

        let wal_end = unified.wal_end()?;
        // The WAL writer gets its own file description: seek position must
        // not be shared with handles other threads read through
        let wal_handle = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.database_file)?;
        let wal = WalWriter::new(
            wal_handle,
            wal_start,
            wal_end,
            next_seq,
            config.wal_fsync_policy,
        );

        // Strongest config tier: the stored config entity, found through
        // the freshly built index. Structural settings (cache sizes, shard
        // count) take effect on the next open; runtime ones apply now.
        if let Some(config_id) = index.lookup("type:config").first() {
            let stored = match store.get(config_id) {
                Some(DirtyEntry::Written(entity)) => Some((*entity).clone()),
                Some(DirtyEntry::Tombstone) => None,
                None => reader.get(config_id).ok().flatten(),
            };
            if let Some(entity) = stored {
                match config.apply_config_entity(&entity) {
                    Ok(()) => info!("applied stored configuration entity"),
                    Err(e) => {
                        warn!(error = %e, "stored config entity is invalid; keeping resolved config")
                    }
                }
            }
        }

        let cache = Arc::new(EntityCache::new(
            config.entity_cache_size,
            config.entity_cache_memory_limit,
        ));
        let interner = Arc::new(StringInterner::new(
            config.string_cache_size,
            config.string_cache_memory_limit,
        ));

        let retention = RetentionManager::with_defaults(
            config.retention_default_max_age,
            config.retention_default_max_tags,
        );
        let recovery = RecoveryManager::new(config.recovery_policy_mode);

        let triggers = CheckpointTriggers {
            ops_threshold: config.checkpoint_operations_threshold,
            bytes_threshold: config.checkpoint_bytes_threshold,
            interval: config.checkpoint_interval,
        };

        let repo = Arc::new(EntityRepository {
            clock,
            unified: Mutex::new(unified),
            wal,
            reader: RwLock::new(Arc::new(reader)),
            store,
            index,
            variants: TagVariantCache::default(),
            cache,
            interner,
            locks: DashMap::new(),
            write_gate: RwLock::new(()),
            checkpoint_lock: Mutex::new(()),
            last_checkpoint: Mutex::new(Instant::now()),
            triggers,
            retention,
            recovery,
            monitor: Mutex::new(None),
            counters: RepositoryCounters::default(),
            closed: AtomicBool::new(false),
            config,
        });

        set_metrics_globally_enabled(repo.config.metrics_globally_enabled);
        repo.start_memory_monitor();

        info!(
            path = %repo.config.database_file.display(),
            entities = repo.index.entity_count(),
            replayed = replay.records.len(),
            "repository open"
        );
        Ok(repo)
    }

    fn start_memory_monitor(self: &Arc<Self>) {
        let thresholds = PressureThresholds {
            medium: 0.60,
            high: self.config.memory_high_pressure_threshold,
            critical: self.config.memory_critical_threshold,
        };
        let monitor = MemoryMonitor::start(
            thresholds,
            self.config.memory_sample_interval,
            self.config.metrics_globally_enabled,
        );

        let cache = Arc::clone(&self.cache);
        monitor.register_callback(Box::new(move |_ratio| {
            cache.evict_fraction(limits::ENTITY_CACHE_PRESSURE_EVICT_FRACTION);
        }));
        let interner = Arc::clone(&self.interner);
        monitor.register_callback(Box::new(move |_ratio| {
            interner.evict_fraction(limits::INTERNER_PRESSURE_EVICT_FRACTION);
        }));

        *self.monitor.lock() = Some(monitor);
    }

    fn pressure(&self) -> PressureLevel {
        self.monitor
            .lock()
            .as_ref()
            .map(|m| m.level())
            .unwrap_or(PressureLevel::Low)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidInput("repository is closed".to_string()));
        }
        Ok(())
    }

    fn entity_lock(&self, id: &EntityId) -> Arc<Mutex<()>> {
        self.locks
            .entry(*id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Intern the hot strings of a tag so repeated namespaces share storage.
    fn intern_tag(&self, tag: &TemporalTag) {
        self.interner.intern(&tag.namespace);
        self.interner.intern(&tag.value);
    }

    // ========================================================================
    // Write operations
    // ========================================================================

    /// Create an entity.
    ///
    /// `tags` are plain `namespace:value` strings (an explicit
    /// `timestamp|` prefix is honored). The mandatory `type:` and
    /// `dataset:` tags must be present; `created_by:<caller>` is stamped
    /// when absent.
    pub fn create(
        &self,
        id: EntityId,
        tags: Vec<String>,
        content: Option<Vec<u8>>,
        caller: &str,
    ) -> Result<Arc<Entity>> {
        self.ensure_open()?;
        let guard = WriteDepthGuard::enter();
        let lock = self.entity_lock(&id);
        let _entity_guard = lock.lock();
        let _gate = self.write_gate.read_recursive();

        if self.exists_unlocked(&id) {
            return Err(Error::already_exists(id.to_string()));
        }

        let now = self.clock.now();
        let mut parsed: Vec<TemporalTag> = Vec::with_capacity(tags.len() + 2);
        for raw in &tags {
            parsed.push(TemporalTag::parse(raw, now)?);
        }
        if !parsed
            .iter()
            .any(|t| t.namespace == namespaces::CREATED_BY)
        {
            parsed.push(TemporalTag::new(now, namespaces::CREATED_BY, caller));
        }
        parsed.sort_by_key(|t| t.timestamp);

        let missing: Vec<&str> = MANDATORY_NAMESPACES
            .iter()
            .copied()
            .filter(|ns| !parsed.iter().any(|t| &t.namespace == ns))
            .collect();
        if !missing.is_empty() {
            return Err(Error::invalid_input(format!(
                "missing mandatory tags: {}",
                missing.join(", ")
            )));
        }

        let (stored_content, content_tag) = self.encode_content(content, now, caller)?;
        if let Some(tag) = content_tag {
            parsed.push(tag);
        }
        let entity = Entity::new(id, parsed, stored_content)?;

        let seq = self.wal.append(
            now,
            id,
            WalPayload::Create {
                tags: entity.tags.clone(),
                content: entity.content.clone(),
            },
        )?;
        self.counters.wal_appends.fetch_add(1, Ordering::Relaxed);
        debug!(id = %id, seq, "create logged");

        let entity = self.apply_write(entity, &[]);
        self.counters.creates.fetch_add(1, Ordering::Relaxed);
        drop(_gate);
        drop(_entity_guard);

        // Writes targeting metric entities never emit metrics themselves
        if !entity.is_metric() {
            self.emit_metric("entity_creates", &guard);
        }
        self.maybe_checkpoint();
        Ok(entity)
    }

    /// Replace an entity's content and extend its tag timeline.
    ///
    /// Historical state is preserved through the immutable tag history;
    /// the data section is untouched until the next checkpoint.
    pub fn update(
        &self,
        id: &EntityId,
        new_tags: Vec<String>,
        content: Option<Vec<u8>>,
        caller: &str,
    ) -> Result<Arc<Entity>> {
        self.ensure_open()?;
        let guard = WriteDepthGuard::enter();
        let lock = self.entity_lock(id);
        let _entity_guard = lock.lock();
        let _gate = self.write_gate.read_recursive();

        let current = self.lookup_unlocked(id)?;
        let now = self.clock.now().max(current.updated_at);

        let mut entity = (*current).clone();
        let before_plain = plain_set(&entity);
        for raw in &new_tags {
            let tag = TemporalTag::parse(raw, now)?;
            let tag = TemporalTag::new(tag.timestamp.max(entity.updated_at), tag.namespace, tag.value);
            entity.append_tag(tag)?;
        }
        if let Some(bytes) = content {
            let (stored, content_tag) = self.encode_content(Some(bytes), now, caller)?;
            entity.content = stored;
            if let Some(tag) = content_tag {
                let tag =
                    TemporalTag::new(tag.timestamp.max(entity.updated_at), tag.namespace, tag.value);
                entity.append_tag(tag)?;
            }
        }

        let seq = self.wal.append(
            now,
            *id,
            WalPayload::Update {
                tags: entity.tags.clone(),
                content: entity.content.clone(),
            },
        )?;
        self.counters.wal_appends.fetch_add(1, Ordering::Relaxed);
        debug!(id = %id, seq, "update logged");

        let after_plain = plain_set(&entity);
        let removed: Vec<String> = before_plain
            .into_iter()
            .filter(|p| !after_plain.contains(p))
            .collect();
        let entity = self.apply_write(entity, &removed);
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        drop(_gate);
        drop(_entity_guard);

        if !entity.is_metric() {
            self.emit_metric("entity_updates", &guard);
        }
        self.maybe_checkpoint();
        Ok(entity)
    }

    /// Append one temporal tag.
    ///
    /// The tag's timestamp must not precede the entity's latest; a
    /// duplicate `(namespace, value)` of the current latest in that
    /// namespace without a strictly greater timestamp is a no-op.
    pub fn add_tag(&self, id: &EntityId, tag: &str) -> Result<Arc<Entity>> {
        self.ensure_open()?;
        let guard = WriteDepthGuard::enter();
        let lock = self.entity_lock(id);
        let _entity_guard = lock.lock();
        let _gate = self.write_gate.read_recursive();

        let current = self.lookup_unlocked(id)?;
        let now = self.clock.now();
        let parsed = TemporalTag::parse(tag, now.max(current.updated_at))?;

        if parsed.timestamp < current.updated_at {
            return Err(Error::invalid_input(format!(
                "tag timestamp {} precedes entity's latest tag at {}",
                parsed.timestamp, current.updated_at
            )));
        }
        if let Some(latest) = current.latest_in_namespace(&parsed.namespace) {
            if latest.value == parsed.value && parsed.timestamp <= latest.timestamp {
                debug!(id = %id, tag = %parsed.plain(), "duplicate tag append is a no-op");
                return Ok(current);
            }
        }

        let seq = self.wal.append(
            parsed.timestamp,
            *id,
            WalPayload::AddTag {
                tag: parsed.clone(),
            },
        )?;
        self.counters.wal_appends.fetch_add(1, Ordering::Relaxed);
        debug!(id = %id, seq, tag = %parsed.plain(), "tag append logged");

        let mut entity = (*current).clone();
        entity.append_tag(parsed)?;
        let entity = self.apply_write(entity, &[]);
        self.counters.tag_appends.fetch_add(1, Ordering::Relaxed);
        drop(_gate);
        drop(_entity_guard);

        if !entity.is_metric() {
            self.emit_metric("entity_tag_appends", &guard);
        }
        self.maybe_checkpoint();
        Ok(entity)
    }

    /// Delete an entity (tombstone).
    ///
    /// The data-section record survives until the next checkpoint reclaims
    /// it; the entity stops resolving immediately.
    pub fn delete(&self, id: &EntityId) -> Result<()> {
        self.ensure_open()?;
        let guard = WriteDepthGuard::enter();
        let lock = self.entity_lock(id);
        let _entity_guard = lock.lock();
        let _gate = self.write_gate.read_recursive();

        let current = self.lookup_unlocked(id)?;

        let seq = self.wal.append(self.clock.now(), *id, WalPayload::Delete)?;
        self.counters.wal_appends.fetch_add(1, Ordering::Relaxed);
        debug!(id = %id, seq, "delete logged");

        self.store.tombstone(*id);
        let plains = plain_set(&current);
        self.index
            .remove_entity(id, plains.iter().map(|s| s.as_str()));
        self.cache.invalidate(id);
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        drop(_gate);
        drop(_entity_guard);

        if !current.is_metric() {
            self.emit_metric("entity_deletes", &guard);
        }
        self.maybe_checkpoint();
        Ok(())
    }

    /// Shared tail of every successful write: store, index, cache, then the
    /// in-line retention pass.
    fn apply_write(&self, mut entity: Entity, removed_plain: &[String]) -> Arc<Entity> {
        for tag in &entity.tags {
            self.intern_tag(tag);
        }

        // In-line retention before anything is published
        let outcome = self
            .retention
            .apply(&mut entity, self.clock.now(), self.pressure());
        if outcome.trimmed > 0 {
            self.counters
                .retention_trims
                .fetch_add(outcome.trimmed as u64, Ordering::Relaxed);
        }

        let id = entity.id;
        for plain in removed_plain {
            self.index.remove(plain, &id);
        }
        for plain in &outcome.removed_plain {
            self.index.remove(plain, &id);
        }
        for tag in &entity.tags {
            self.index.insert(&tag.plain(), id);
        }

        let entity = Arc::new(entity);
        self.store.put(Arc::clone(&entity));
        // Surgical: this entity only, never the whole cache
        self.cache.invalidate(&id);
        entity
    }

    // ========================================================================
    // Content handling
    // ========================================================================

    /// Choose the stored content variant from the payload size.
    fn encode_content(
        &self,
        content: Option<Vec<u8>>,
        now: Timestamp,
        caller: &str,
    ) -> Result<(Content, Option<TemporalTag>)> {
        let Some(bytes) = content else {
            return Ok((Content::Empty, None));
        };
        if bytes.is_empty() {
            return Ok((Content::Empty, None));
        }
        let marker = TemporalTag::new(now, namespaces::CONTENT, "updated");
        let len = bytes.len() as u64;

        if len > self.config.content_chunk_threshold {
            let chunks = self.write_chunks(&bytes, now, caller)?;
            return Ok((Content::Chunked(chunks), Some(marker)));
        }
        if len > self.config.content_compression_threshold {
            let data = zstd::bulk::compress(&bytes, 0)
                .map_err(|e| Error::Transient(format!("content compression: {}", e)))?;
            return Ok((
                Content::Compressed {
                    raw_len: len,
                    data,
                },
                Some(marker),
            ));
        }
        Ok((Content::Inline(bytes), Some(marker)))
    }

    /// Split an oversized payload into chunk entities, written through the
    /// normal path (and therefore WAL-durable like everything else).
    fn write_chunks(&self, bytes: &[u8], now: Timestamp, caller: &str) -> Result<Vec<EntityId>> {
        let chunk_size = self.config.content_chunk_threshold.max(1) as usize;
        let mut chunk_ids = Vec::with_capacity(bytes.len() / chunk_size + 1);
        for piece in bytes.chunks(chunk_size) {
            let chunk_id = EntityId::generate();
            let tags: Vec<TemporalTag> = vec![
                TemporalTag::new(now, namespaces::TYPE, CHUNK_ENTITY_TYPE),
                TemporalTag::new(now, namespaces::DATASET, "system"),
                TemporalTag::new(now, namespaces::CREATED_BY, caller),
            ];
            let chunk = Entity::new(chunk_id, tags, Content::Inline(piece.to_vec()))?;

            self.wal.append(
                now,
                chunk_id,
                WalPayload::Create {
                    tags: chunk.tags.clone(),
                    content: chunk.content.clone(),
                },
            )?;
            self.counters.wal_appends.fetch_add(1, Ordering::Relaxed);
            self.apply_write(chunk, &[]);
            chunk_ids.push(chunk_id);
        }
        Ok(chunk_ids)
    }

    /// Materialize an entity's content bytes: inline returned as-is,
    /// compressed inflated lazily, chunked reassembled from chunk entities.
    pub fn get_content(&self, id: &EntityId) -> Result<Vec<u8>> {
        let entity = self.get(id)?;
        match &entity.content {
            Content::Empty => Ok(Vec::new()),
            Content::Inline(data) => Ok(data.clone()),
            Content::Compressed { raw_len, data } => {
                zstd::bulk::decompress(data, *raw_len as usize).map_err(|e| {
                    Error::corrupted(id.to_string(), format!("content inflation failed: {}", e))
                })
            }
            Content::Chunked(chunks) => {
                let mut out = Vec::new();
                for chunk_id in chunks {
                    let chunk = self.get(chunk_id).map_err(|_| {
                        Error::corrupted(id.to_string(), format!("missing chunk {}", chunk_id))
                    })?;
                    match &chunk.content {
                        Content::Inline(data) => out.extend_from_slice(data),
                        _ => {
                            return Err(Error::corrupted(
                                id.to_string(),
                                "chunk entity does not carry inline content",
                            ))
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    // ========================================================================
    // Read operations
    // ========================================================================

    /// Existence check that engages no recovery.
    fn exists_unlocked(&self, id: &EntityId) -> bool {
        match self.store.get(id) {
            Some(DirtyEntry::Written(_)) => true,
            Some(DirtyEntry::Tombstone) => false,
            None => self.reader.read().contains(id),
        }
    }

    /// Cache → dirty store → mmap, with no recovery.
    fn lookup(&self, id: &EntityId) -> Result<Arc<Entity>> {
        if let Some(hit) = self.cache.get(id) {
            return Ok(hit);
        }
        self.lookup_uncached(id)
    }

    fn lookup_uncached(&self, id: &EntityId) -> Result<Arc<Entity>> {
        match self.store.get(id) {
            Some(DirtyEntry::Written(entity)) => return Ok(entity),
            Some(DirtyEntry::Tombstone) => return Err(Error::not_found(id.to_string())),
            None => {}
        }
        let reader = Arc::clone(&self.reader.read());
        match reader.get(id)? {
            Some(entity) => {
                let entity = Arc::new(entity);
                self.cache.insert(Arc::clone(&entity));
                Ok(entity)
            }
            None => Err(Error::not_found(id.to_string())),
        }
    }

    /// Same as `lookup` but used under the entity lock by writers.
    fn lookup_unlocked(&self, id: &EntityId) -> Result<Arc<Entity>> {
        self.lookup(id)
    }

    /// Fetch an entity, engaging the recovery manager on a total miss.
    pub fn get(&self, id: &EntityId) -> Result<Arc<Entity>> {
        self.ensure_open()?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);

        match self.lookup(id) {
            Ok(entity) => Ok(entity),
            Err(e) if e.is_not_found() => self.recover_or_not_found(id),
            Err(e) => {
                // One retry through recovery for transient/corrupt reads
                warn!(id = %id, error = %e, "read failed; engaging recovery");
                self.recover_or_not_found(id)
            }
        }
    }

    fn recover_or_not_found(&self, id: &EntityId) -> Result<Arc<Entity>> {
        // A tombstone is an authoritative miss: the data-section record may
        // survive until the next checkpoint, and recovery must not
        // resurrect it from there
        if matches!(self.store.get(id), Some(DirtyEntry::Tombstone)) {
            return Err(Error::not_found(id.to_string()));
        }
        match self.recovery.decide(id) {
            RecoveryDecision::Skip => Err(Error::not_found(id.to_string())),
            RecoveryDecision::Always | RecoveryDecision::Attempt => {
                let wal = {
                    // Fresh read-only handle: seek position stays private
                    let unified = self.unified.lock();
                    let wal_start = unified.wal_start();
                    let mut file = std::fs::File::open(unified.path())?;
                    drop(unified);
                    WalReader::read_from_file(&mut file, wal_start)?
                };
                let reader = Arc::clone(&self.reader.read());
                match self.recovery.attempt(id, &wal, &reader, &self.index) {
                    Some((entity, source)) => {
                        info!(id = %id, ?source, "entity recovered");
                        let entity = Arc::new(entity);
                        self.store.put(Arc::clone(&entity));
                        self.cache.insert(Arc::clone(&entity));
                        Ok(entity)
                    }
                    None => Err(Error::not_found(id.to_string())),
                }
            }
        }
    }

    /// Summaries of every live entity.
    pub fn list(&self) -> Result<Vec<EntitySummary>> {
        self.ensure_open()?;
        let mut out: Vec<EntitySummary> = self
            .live_entities()
            .iter()
            .map(|e| EntitySummary {
                id: e.id,
                entity_type: e.entity_type().map(str::to_string),
                dataset: e.dataset().map(str::to_string),
                updated_at: e.updated_at,
            })
            .collect();
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    /// Entities carrying a tag (exact or timestamped spelling).
    pub fn list_by_tag(&self, tag: &str) -> Result<Vec<Arc<Entity>>> {
        self.ensure_open()?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let mut out = Vec::new();
        let mut seen = rustc_hash::FxHashSet::default();
        for variant in self.variants.variants_for(tag).iter() {
            let key = TagVariantCache::index_key(variant);
            for id in self.index.lookup(key) {
                if seen.insert(id) {
                    if let Ok(entity) = self.lookup(&id) {
                        out.push(entity);
                    }
                }
            }
        }
        out.sort_by_key(|e| e.id);
        Ok(out)
    }

    /// Entities matching a conjunction of tag requirements; a trailing `*`
    /// in a requirement makes it a prefix match.
    pub fn query<S: AsRef<str>>(&self, requirements: &[S]) -> Result<Vec<Arc<Entity>>> {
        self.ensure_open()?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let selector = Selector::parse(requirements)?;
        let mut out = Vec::new();
        for id in selector.evaluate(&self.index, &self.variants) {
            if let Ok(entity) = self.lookup(&id) {
                out.push(entity);
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Temporal operations
    // ========================================================================

    /// The entity as of a past instant.
    pub fn get_as_of(&self, id: &EntityId, at: Timestamp) -> Result<AsOfView> {
        let entity = self.get(id)?;
        Ok(temporal::as_of(&entity, at))
    }

    /// Tag events in `[t0, t1]`, in timeline order.
    pub fn get_history(
        &self,
        id: &EntityId,
        t0: Timestamp,
        t1: Timestamp,
        cancel: &AtomicBool,
    ) -> Result<Vec<TemporalTag>> {
        let entity = self.get(id)?;
        temporal::history(&entity, t0, t1, cancel)
    }

    /// Added/removed tags between two instants.
    pub fn get_diff(&self, id: &EntityId, t1: Timestamp, t2: Timestamp) -> Result<TagDiff> {
        let entity = self.get(id)?;
        Ok(temporal::diff(&entity, t1, t2))
    }

    /// Entities updated after `since`, with their tag events after it.
    pub fn get_recent_changes(&self, since: Timestamp) -> Result<Vec<EntityChanges>> {
        self.ensure_open()?;
        let live = self.live_entities();
        Ok(temporal::recent_changes(
            live.iter().map(|e| e.as_ref()),
            since,
        ))
    }

    /// Merged live set: data section overlaid with dirty writes, minus
    /// tombstones and purged entities.
    fn live_entities(&self) -> Vec<Arc<Entity>> {
        let reader = Arc::clone(&self.reader.read());
        let (persisted, corrupt) = reader.iter_entities();
        if corrupt > 0 {
            warn!(corrupt, "live-set iteration skipped corrupt records");
        }
        let mut merged: FxHashMap<EntityId, Arc<Entity>> = persisted
            .into_iter()
            .map(|e| (e.id, Arc::new(e)))
            .collect();
        for (id, entry) in self.store.drain_snapshot() {
            match entry {
                DirtyEntry::Written(entity) => {
                    merged.insert(id, entity);
                }
                DirtyEntry::Tombstone => {
                    merged.remove(&id);
                }
            }
        }
        merged.into_values().collect()
    }

    // ========================================================================
    // Checkpoint and shutdown
    // ========================================================================

    fn maybe_checkpoint(&self) {
        let elapsed = self.last_checkpoint.lock().elapsed();
        if !self
            .triggers
            .due(self.wal.ops_since_checkpoint(), self.wal.bytes(), elapsed)
        {
            return;
        }
        // Deferred when writers (including this thread's outer write) are
        // in flight; the trigger stays due and the next quiescent moment
        // takes it
        if let Err(e) = self.checkpoint_inner(false) {
            error!(error = %e, "deferred checkpoint failed");
        }
    }

    /// Force a checkpoint now.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        self.checkpoint_inner(true)
    }

    fn checkpoint_inner(&self, block: bool) -> Result<()> {
        let _ckpt = match self.checkpoint_lock.try_lock() {
            Some(guard) => guard,
            None if block => self.checkpoint_lock.lock(),
            None => return Ok(()),
        };
        let gate = if block {
            Some(self.write_gate.write())
        } else {
            match self.write_gate.try_write() {
                Some(g) => Some(g),
                None => return Ok(()),
            }
        };

        // Drop purged entities and their index entries at the boundary
        let mut live: Vec<Entity> = Vec::new();
        for entity in self.live_entities() {
            if entity.lifecycle_state() == entitydb_core::LifecycleState::Purged {
                let plains = plain_set(&entity);
                self.index
                    .remove_entity(&entity.id, plains.iter().map(|s| s.as_str()));
                self.cache.invalidate(&entity.id);
                continue;
            }
            live.push((*entity).clone());
        }
        live.sort_by_key(|e| e.id);

        let index_snapshot = self.index.snapshot();
        let index_population = self.index.entity_count();
        if index_population != live.len() {
            warn!(
                index = index_population,
                live = live.len(),
                "index population disagrees with live set at checkpoint"
            );
        }

        let now = self.clock.now();
        let path = self.config.database_file.clone();
        let (file, header, outcome) = write_checkpoint(&path, &live, &index_snapshot, now)?;

        // The mmap takes no seek position, so it may share the locked
        // handle; the WAL writer needs a private description
        let reader_file = file.try_clone()?;
        let wal_handle = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)?;
        {
            let mut unified = self.unified.lock();
            unified.replace_after_checkpoint(file, header);
        }
        self.wal.reset_after_checkpoint(wal_handle, header.wal_offset);
        let new_reader = MappedReader::map(&reader_file, &header)?;
        *self.reader.write() = Arc::new(new_reader);
        self.store.clear();

        drop(gate);
        *self.last_checkpoint.lock() = Instant::now();
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        debug!(entities = outcome.entity_count, "checkpoint installed");
        Ok(())
    }

    /// Abandon the repository without checkpointing or syncing.
    ///
    /// Crash-simulation hook: state beyond what the WAL already holds is
    /// discarded, exactly as a process kill would. File handles release
    /// with the value, so the same process can reopen the database.
    pub fn abandon(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut monitor) = self.monitor.lock().take() {
            monitor.shutdown();
        }
        warn!("repository abandoned without checkpoint");
    }

    /// Checkpoint, stop background work, and release the file.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut monitor) = self.monitor.lock().take() {
            monitor.shutdown();
        }
        self.wal.sync()?;
        self.checkpoint_inner(true)?;
        info!("repository closed");
        Ok(())
    }

    // ========================================================================
    // Metrics and observability
    // ========================================================================

    /// Record an operation as a metric-entity tag write.
    ///
    /// Skipped beyond write depth one and under the global kill-switch;
    /// metric entities themselves never emit (reserved prefix).
    fn emit_metric(&self, name: &str, guard: &WriteDepthGuard) {
        if !guard.may_emit() || !crate::metrics::metrics_globally_enabled() {
            self.counters
                .metric_suppressions
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        let id = metric_entity_id(name);
        let count = self.counters.snapshot();
        let value = match name {
            "entity_creates" => count.creates,
            "entity_updates" => count.updates,
            "entity_tag_appends" => count.tag_appends,
            "entity_deletes" => count.deletes,
            _ => 0,
        };

        let result = if self.exists_unlocked(&id) {
            self.add_tag(&id, &format!("metric:{}:{}", name, value))
                .map(|_| ())
        } else {
            self.create(
                id,
                vec![
                    format!("{}:{}", namespaces::TYPE, "metric"),
                    format!("{}:{}", namespaces::DATASET, "system"),
                    format!("metric:{}:{}", name, value),
                ],
                None,
                "engine",
            )
            .map(|_| ())
        };
        match result {
            Ok(()) => {
                self.counters.metric_writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => debug!(error = %e, metric = name, "metric emission failed"),
        }
    }

    /// Observable engine counters.
    pub fn counters(&self) -> &RepositoryCounters {
        &self.counters
    }

    /// Cache counters (hits, misses, evictions, invalidations).
    pub fn cache_counters(&self) -> &entitydb_storage::CacheCounters {
        self.cache.counters()
    }

    /// Recovery counters (attempts, skips, outcomes).
    pub fn recovery_counters(&self) -> &entitydb_durability::RecoveryCounters {
        self.recovery.counters()
    }

    /// The resolved configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of live entities per the tag index.
    pub fn entity_count(&self) -> usize {
        self.index.entity_count()
    }

    /// The wall clock in use.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl Drop for EntityRepository {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                error!(error = %e, "close during drop failed");
            }
        }
    }
}

fn plain_set(entity: &Entity) -> Vec<String> {
    entity.tags.iter().map(|t| t.plain()).collect()
}

/// Apply one replayed WAL record to the in-memory state at open.
fn apply_replayed(
    store: &EntityStore,
    index: &ShardedTagIndex,
    reader: &MappedReader,
    record: &entitydb_durability::WalRecord,
) {
    let id = record.entity_id;
    match &record.payload {
        WalPayload::Create { tags, content } | WalPayload::Update { tags, content } => {
            match Entity::new(id, tags.clone(), content.clone()) {
                Ok(entity) => {
                    for tag in &entity.tags {
                        index.insert(&tag.plain(), id);
                    }
                    store.put(Arc::new(entity));
                }
                Err(e) => warn!(id = %id, error = %e, "skipping invalid replayed record"),
            }
        }
        WalPayload::AddTag { tag } => {
            let current = match store.get(&id) {
                Some(DirtyEntry::Written(entity)) => Some((*entity).clone()),
                Some(DirtyEntry::Tombstone) => None,
                None => reader.get(&id).ok().flatten(),
            };
            match current {
                Some(mut entity) => {
                    if entity.append_tag(tag.clone()).is_ok() {
                        index.insert(&tag.plain(), id);
                        store.put(Arc::new(entity));
                    }
                }
                None => warn!(id = %id, "replayed tag append targets a missing entity"),
            }
        }
        WalPayload::Delete => {
            let tags: Vec<String> = match store.get(&id) {
                Some(DirtyEntry::Written(entity)) => {
                    entity.tags.iter().map(|t| t.plain()).collect()
                }
                _ => reader
                    .get(&id)
                    .ok()
                    .flatten()
                    .map(|e| e.tags.iter().map(|t| t.plain()).collect())
                    .unwrap_or_default(),
            };
            index.remove_entity(&id, tags.iter().map(|s| s.as_str()));
            store.tombstone(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.database_file = dir.join("test.edb");
        config.index_shard_count = 16;
        config.checkpoint_operations_threshold = u64::MAX;
        config.checkpoint_bytes_threshold = u64::MAX;
        config.checkpoint_interval = std::time::Duration::from_secs(3600);
        config.metrics_globally_enabled = false;
        config
    }

    fn mandatory_tags() -> Vec<String> {
        vec![
            "type:task".to_string(),
            "dataset:ops".to_string(),
            "created_by:u001".to_string(),
        ]
    }

    #[test]
    fn create_get_round_trip() {
        let dir = tempdir().unwrap();
        let repo = EntityRepository::open(test_config(dir.path())).unwrap();

        let id = EntityId::generate();
        let created = repo
            .create(id, mandatory_tags(), Some(b"payload".to_vec()), "u001")
            .unwrap();
        assert_eq!(created.entity_type(), Some("task"));

        let fetched = repo.get(&id).unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(repo.get_content(&id).unwrap(), b"payload");
        repo.close().unwrap();
    }

    #[test]
    fn create_requires_mandatory_tags() {
        let dir = tempdir().unwrap();
        let repo = EntityRepository::open(test_config(dir.path())).unwrap();

        let err = repo
            .create(
                EntityId::generate(),
                vec!["type:task".to_string()],
                None,
                "u001",
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(err.to_string().contains("dataset"));
        repo.close().unwrap();
    }

    #[test]
    fn create_stamps_created_by_from_caller() {
        let dir = tempdir().unwrap();
        let repo = EntityRepository::open(test_config(dir.path())).unwrap();

        let id = EntityId::generate();
        let entity = repo
            .create(
                id,
                vec!["type:task".to_string(), "dataset:ops".to_string()],
                None,
                "service-a",
            )
            .unwrap();
        assert_eq!(
            entity.latest_in_namespace("created_by").unwrap().value,
            "service-a"
        );
        repo.close().unwrap();
    }

    #[test]
    fn duplicate_create_is_already_exists() {
        let dir = tempdir().unwrap();
        let repo = EntityRepository::open(test_config(dir.path())).unwrap();

        let id = EntityId::generate();
        repo.create(id, mandatory_tags(), None, "u001").unwrap();
        let err = repo.create(id, mandatory_tags(), None, "u001").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        repo.close().unwrap();
    }

    #[test]
    fn add_tag_updates_index() {
        let dir = tempdir().unwrap();
        let repo = EntityRepository::open(test_config(dir.path())).unwrap();

        let id = EntityId::generate();
        repo.create(id, mandatory_tags(), None, "u001").unwrap();
        repo.add_tag(&id, "status:open").unwrap();

        let hits = repo.list_by_tag("status:open").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        repo.close().unwrap();
    }

    #[test]
    fn duplicate_add_tag_is_noop() {
        let dir = tempdir().unwrap();
        let repo = EntityRepository::open(test_config(dir.path())).unwrap();

        let id = EntityId::generate();
        repo.create(id, mandatory_tags(), None, "u001").unwrap();
        let after_first = repo.add_tag(&id, "status:open").unwrap();
        let tag_count = after_first.tags.len();

        // Same (namespace, value) with an explicit non-greater timestamp
        let ts = after_first.updated_at.as_nanos();
        let after_second = repo
            .add_tag(&id, &format!("{}|status:open", ts))
            .unwrap();
        assert_eq!(after_second.tags.len(), tag_count);
        repo.close().unwrap();
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let dir = tempdir().unwrap();
        let repo = EntityRepository::open(test_config(dir.path())).unwrap();

        // Mixed-alphanumeric id so recovery engages (and finds the tombstone)
        let id = EntityId::parse("taskAboutNothing00000000000000Z1").unwrap();
        repo.create(id, mandatory_tags(), None, "u001").unwrap();
        repo.delete(&id).unwrap();

        assert!(repo.get(&id).unwrap_err().is_not_found());
        assert!(repo.list_by_tag("type:task").unwrap().is_empty());
        repo.close().unwrap();
    }

    #[test]
    fn update_appends_tags_and_replaces_content() {
        let dir = tempdir().unwrap();
        let repo = EntityRepository::open(test_config(dir.path())).unwrap();

        let id = EntityId::generate();
        repo.create(id, mandatory_tags(), Some(b"v1".to_vec()), "u001")
            .unwrap();
        let updated = repo
            .update(
                &id,
                vec!["status:done".to_string()],
                Some(b"v2".to_vec()),
                "u001",
            )
            .unwrap();

        assert_eq!(updated.latest_in_namespace("status").unwrap().value, "done");
        assert_eq!(repo.get_content(&id).unwrap(), b"v2");
        // History survived the update
        assert_eq!(updated.entity_type(), Some("task"));
        repo.close().unwrap();
    }

    #[test]
    fn checkpoint_then_reopen_preserves_state() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        let id = EntityId::generate();
        {
            let repo = EntityRepository::open(config.clone()).unwrap();
            repo.create(id, mandatory_tags(), Some(b"durable".to_vec()), "u001")
                .unwrap();
            repo.add_tag(&id, "status:open").unwrap();
            repo.checkpoint().unwrap();
            repo.close().unwrap();
        }

        let repo = EntityRepository::open(config).unwrap();
        let entity = repo.get(&id).unwrap();
        assert_eq!(entity.latest_in_namespace("status").unwrap().value, "open");
        assert_eq!(repo.get_content(&id).unwrap(), b"durable");
        assert_eq!(repo.entity_count(), 1);
        repo.close().unwrap();
    }

    #[test]
    fn unclean_shutdown_replays_wal() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());

        let id = EntityId::generate();
        {
            let repo = EntityRepository::open(config.clone()).unwrap();
            repo.create(id, mandatory_tags(), None, "u001").unwrap();
            repo.add_tag(&id, "status:open").unwrap();
            // No checkpoint, no close: only the WAL survives
            repo.abandon();
        }

        let repo = EntityRepository::open(config).unwrap();
        let entity = repo.get(&id).unwrap();
        assert_eq!(entity.latest_in_namespace("status").unwrap().value, "open");
        repo.close().unwrap();
    }

    #[test]
    fn query_intersects_requirements() {
        let dir = tempdir().unwrap();
        let repo = EntityRepository::open(test_config(dir.path())).unwrap();

        let a = EntityId::generate();
        let b = EntityId::generate();
        repo.create(a, mandatory_tags(), None, "u001").unwrap();
        repo.create(b, mandatory_tags(), None, "u001").unwrap();
        repo.add_tag(&a, "status:open").unwrap();
        repo.add_tag(&b, "status:closed").unwrap();

        let open_tasks = repo.query(&["type:task", "status:open"]).unwrap();
        assert_eq!(open_tasks.len(), 1);
        assert_eq!(open_tasks[0].id, a);

        let by_prefix = repo.query(&["status:*"]).unwrap();
        assert_eq!(by_prefix.len(), 2);
        repo.close().unwrap();
    }

    #[test]
    fn pure_hex_miss_skips_recovery() {
        let dir = tempdir().unwrap();
        let repo = EntityRepository::open(test_config(dir.path())).unwrap();

        let ghost = EntityId::parse("deadbeefdeadbeefdeadbeefdeadbeef").unwrap();
        assert!(repo.get(&ghost).unwrap_err().is_not_found());

        let skips = repo
            .recovery_counters()
            .skips
            .load(std::sync::atomic::Ordering::Relaxed);
        let attempts = repo
            .recovery_counters()
            .attempts
            .load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(skips, 1);
        assert_eq!(attempts, 0);
        repo.close().unwrap();
    }

    #[test]
    fn compressed_and_chunked_content_round_trip() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.content_compression_threshold = 64;
        config.content_chunk_threshold = 256;
        let repo = EntityRepository::open(config).unwrap();

        // Compressible payload above the compression threshold
        let medium = vec![b'a'; 200];
        let id1 = EntityId::generate();
        repo.create(id1, mandatory_tags(), Some(medium.clone()), "u001")
            .unwrap();
        assert!(matches!(
            repo.get(&id1).unwrap().content,
            Content::Compressed { .. }
        ));
        assert_eq!(repo.get_content(&id1).unwrap(), medium);

        // Payload exactly at the chunk threshold stays unchunked
        let at_threshold = vec![b'b'; 256];
        let id2 = EntityId::generate();
        repo.create(id2, mandatory_tags(), Some(at_threshold.clone()), "u001")
            .unwrap();
        assert!(!matches!(
            repo.get(&id2).unwrap().content,
            Content::Chunked(_)
        ));
        assert_eq!(repo.get_content(&id2).unwrap(), at_threshold);

        // One byte over: chunked
        let over = vec![b'c'; 257];
        let id3 = EntityId::generate();
        repo.create(id3, mandatory_tags(), Some(over.clone()), "u001")
            .unwrap();
        assert!(matches!(
            repo.get(&id3).unwrap().content,
            Content::Chunked(_)
        ));
        assert_eq!(repo.get_content(&id3).unwrap(), over);
        repo.close().unwrap();
    }

    #[test]
    fn temporal_queries_through_facade() {
        let dir = tempdir().unwrap();
        let repo = EntityRepository::open(test_config(dir.path())).unwrap();

        let id = EntityId::generate();
        repo.create(id, mandatory_tags(), None, "u001").unwrap();
        let before = repo.get(&id).unwrap().updated_at;
        repo.add_tag(&id, "status:open").unwrap();
        let mid = repo.get(&id).unwrap().updated_at;
        repo.add_tag(&id, "status:closed").unwrap();

        let view = repo.get_as_of(&id, mid).unwrap();
        let status = view.tags.iter().find(|t| t.namespace == "status").unwrap();
        assert_eq!(status.value, "open");

        let diff = repo.get_diff(&id, before, Timestamp::MAX).unwrap();
        assert!(diff
            .added
            .iter()
            .any(|e| e.namespace == "status" && e.value == "closed"));

        let cancel = AtomicBool::new(false);
        let history = repo
            .get_history(&id, Timestamp::ZERO, Timestamp::MAX, &cancel)
            .unwrap();
        assert!(history.len() >= 5);
        repo.close().unwrap();
    }

    #[test]
    fn counters_advance() {
        let dir = tempdir().unwrap();
        let repo = EntityRepository::open(test_config(dir.path())).unwrap();

        let id = EntityId::generate();
        repo.create(id, mandatory_tags(), None, "u001").unwrap();
        repo.add_tag(&id, "status:open").unwrap();
        repo.get(&id).unwrap();

        let snap = repo.counters().snapshot();
        assert_eq!(snap.creates, 1);
        assert_eq!(snap.tag_appends, 1);
        assert!(snap.reads >= 1);
        assert!(snap.wal_appends >= 2);
        repo.close().unwrap();
    }
}
