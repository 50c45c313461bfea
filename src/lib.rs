//! # EntityDB
//!
//! A single-node temporal database. Every entity carries an append-only
//! timeline of nanosecond-stamped tags; all durable state lives in one
//! unified `.edb` file with a write-ahead log at its tail; reads go through
//! a sharded tag index, a bounded cache, and a memory-mapped data section.
//!
//! # Quick start
//!
//! ```no_run
//! use entitydb::{EngineConfig, EntityDb, EntityId};
//!
//! fn main() -> entitydb::Result<()> {
//!     let mut config = EngineConfig::default();
//!     config.database_file = "example.edb".into();
//!     let db = EntityDb::open(config)?;
//!     let repo = db.repository();
//!
//!     let id = EntityId::generate();
//!     repo.create(
//!         id,
//!         vec![
//!             "type:task".to_string(),
//!             "dataset:ops".to_string(),
//!             "status:open".to_string(),
//!         ],
//!         Some(b"payload".to_vec()),
//!         "u001",
//!     )?;
//!     repo.add_tag(&id, "status:closed")?;
//!
//!     // The entity as it was before the status change
//!     let earlier = repo.get(&id)?.created_at;
//!     let view = repo.get_as_of(&id, earlier)?;
//!     assert!(view.tags.iter().any(|t| t.value == "open"));
//!
//!     db.close()
//! }
//! ```

#![warn(missing_docs)]

pub use entitydb_core::{
    namespaces, Clock, Content, Entity, EntityId, Error, LifecycleState, Result, SystemClock,
    TemporalTag, Timestamp, ENTITY_ID_LEN, SYSTEM_USER_ID,
};
pub use entitydb_durability::{
    FsyncPolicy, RecoveryDecision, RecoveryPolicyMode, UnifiedFile, EUFF_FORMAT_VERSION,
    EUFF_MAGIC,
};
pub use entitydb_engine::{
    metric_entity_id, AppliesTo, AsOfView, CollectorConfig, CollectorStats, ConfigOverrides,
    CounterSnapshot, DeletionCollector, DiffEntry, EngineConfig, EntityChanges, EntityDb,
    EntityRepository, EntitySummary, LifecycleRule, PressureLevel, RetentionPolicy,
    RuleCondition, Selector, TagDiff,
};
pub use entitydb_storage::{EntityCache, ShardedTagIndex, StringInterner};
