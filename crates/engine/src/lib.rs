//! Database engine for EntityDB
//!
//! This crate orchestrates all lower layers:
//! - `EntityRepository`: the façade coordinating WAL, index, cache,
//!   retention, recovery, and checkpoints
//! - `EntityDb`: repository plus the background deletion collector, with
//!   an open/close lifecycle
//! - temporal queries (as-of, history, diff, recent changes)
//! - in-line retention and lifecycle policies
//! - memory monitoring with pressure callbacks
//! - metrics emission with recursion prevention
//! - three-tier configuration resolution

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collector;
pub mod config;
pub mod memory;
pub mod metrics;
pub mod repository;
pub mod retention;
pub mod selector;
pub mod temporal;

pub use collector::{CollectorConfig, CollectorStats, DeletionCollector};
pub use config::{parse_fsync_policy, ConfigOverrides, EngineConfig, CONFIG_FILE_NAME};
pub use memory::{MemoryMonitor, PressureLevel, PressureThresholds};
pub use metrics::{
    metric_entity_id, metrics_globally_enabled, set_metrics_globally_enabled, CounterSnapshot,
    RepositoryCounters,
};
pub use repository::{EntityRepository, EntitySummary};
pub use retention::{
    default_lifecycle_policies, AppliesTo, LifecycleRule, RetentionManager, RetentionPolicy,
    RuleCondition, TrimOutcome, TrimPolicy,
};
pub use selector::{Selector, TagMatch};
pub use temporal::{AsOfView, DiffEntry, EntityChanges, TagDiff};

use entitydb_core::Result;
use std::sync::Arc;

/// An open database: the repository façade plus its background services.
pub struct EntityDb {
    repo: Arc<EntityRepository>,
    collector: Option<DeletionCollector>,
}

impl EntityDb {
    /// Open (or create) a database with the given configuration, starting
    /// the deletion collector when enabled.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let collector_config = CollectorConfig {
            interval: config.deletion_collector_interval,
            max_runtime: config.deletion_collector_interval.min(
                std::time::Duration::from_secs(300),
            ),
            batch_size: config.deletion_collector_batch_size,
            concurrency: config.deletion_collector_concurrency,
            dry_run: config.deletion_collector_dry_run,
        };
        let collector_enabled = config.deletion_collector_enabled;

        let repo = EntityRepository::open(config)?;
        let collector = if collector_enabled {
            Some(DeletionCollector::start(
                Arc::clone(&repo),
                collector_config,
            ))
        } else {
            None
        };
        Ok(EntityDb { repo, collector })
    }

    /// The repository façade.
    pub fn repository(&self) -> &Arc<EntityRepository> {
        &self.repo
    }

    /// Collector statistics, when the collector is running.
    pub fn collector_stats(&self) -> Option<&CollectorStats> {
        self.collector.as_ref().map(|c| c.stats())
    }

    /// Stop background services, checkpoint, and release the file.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut collector) = self.collector.take() {
            collector.shutdown();
        }
        self.repo.close()
    }

    /// Abandon the database without checkpointing — crash simulation.
    ///
    /// Only WAL-durable state survives; the same process can reopen the
    /// file immediately.
    pub fn abandon(mut self) {
        if let Some(mut collector) = self.collector.take() {
            collector.shutdown();
        }
        self.repo.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitydb_core::EntityId;
    use tempfile::tempdir;

    #[test]
    fn db_open_close_cycle() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.database_file = dir.path().join("db.edb");
        config.index_shard_count = 16;
        config.deletion_collector_enabled = false;
        config.metrics_globally_enabled = false;

        let db = EntityDb::open(config.clone()).unwrap();
        let id = EntityId::generate();
        db.repository()
            .create(
                id,
                vec![
                    "type:task".to_string(),
                    "dataset:ops".to_string(),
                    "created_by:u001".to_string(),
                ],
                None,
                "u001",
            )
            .unwrap();
        db.close().unwrap();

        let db = EntityDb::open(config).unwrap();
        assert!(db.repository().get(&id).is_ok());
        db.close().unwrap();
    }

    #[test]
    fn collector_runs_when_enabled() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.database_file = dir.path().join("db.edb");
        config.index_shard_count = 16;
        config.deletion_collector_enabled = true;
        config.deletion_collector_interval = std::time::Duration::from_secs(3600);
        config.metrics_globally_enabled = false;

        let db = EntityDb::open(config).unwrap();
        assert!(db.collector_stats().is_some());
        db.close().unwrap();
    }
}
