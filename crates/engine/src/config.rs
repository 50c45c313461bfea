//! Engine configuration
//!
//! Options resolve across three tiers, strongest first:
//!
//! 1. a database-stored entity of `type:config` (applied after open)
//! 2. caller-supplied overrides (command-line flags, or an
//!    `entitydb.toml` file next to the database)
//! 3. environment variables (`ENTITYDB_*`)
//!
//! with compiled-in defaults underneath. The stored-config tier exists so
//! an operator can tune a running database without touching its host; it
//! wins precisely because it travels with the data file.

use entitydb_core::{limits, Entity, Error, Result};
use entitydb_durability::{FsyncPolicy, RecoveryPolicyMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Config file name looked up next to the database file.
pub const CONFIG_FILE_NAME: &str = "entitydb.toml";

/// Tag namespace prefix for the stored-config tier.
pub const CONFIG_TAG_PREFIX: &str = "config";

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the unified database file — the single source of truth for
    /// where data lives.
    pub database_file: PathBuf,
    /// WAL fsync policy.
    pub wal_fsync_policy: FsyncPolicy,
    /// Checkpoint after this many WAL operations.
    pub checkpoint_operations_threshold: u64,
    /// Checkpoint after this many WAL bytes.
    pub checkpoint_bytes_threshold: u64,
    /// Checkpoint after this much elapsed time.
    pub checkpoint_interval: Duration,
    /// String interner entry cap.
    pub string_cache_size: usize,
    /// String interner byte cap.
    pub string_cache_memory_limit: u64,
    /// Entity cache entry cap.
    pub entity_cache_size: usize,
    /// Entity cache byte cap.
    pub entity_cache_memory_limit: u64,
    /// Tag index shard count (power of two, 16..=256).
    pub index_shard_count: usize,
    /// Memory fraction at which pressure becomes high.
    pub memory_high_pressure_threshold: f64,
    /// Memory fraction at which pressure becomes critical.
    pub memory_critical_threshold: f64,
    /// Memory monitor sampling interval.
    pub memory_sample_interval: Duration,
    /// Content above this size is zstd-compressed.
    pub content_compression_threshold: u64,
    /// Content above this size is chunked.
    pub content_chunk_threshold: u64,
    /// Default retention age cap.
    pub retention_default_max_age: Duration,
    /// Default retention tag-count cap.
    pub retention_default_max_tags: usize,
    /// Whether the deletion collector runs.
    pub deletion_collector_enabled: bool,
    /// Deletion collector cycle interval.
    pub deletion_collector_interval: Duration,
    /// Deletion collector batch size.
    pub deletion_collector_batch_size: usize,
    /// Deletion collector worker count.
    pub deletion_collector_concurrency: usize,
    /// Deletion collector logs instead of mutating.
    pub deletion_collector_dry_run: bool,
    /// Recovery strictness.
    pub recovery_policy_mode: RecoveryPolicyMode,
    /// Master switch for metric-entity emission.
    pub metrics_globally_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_file: PathBuf::from("entitydb.edb"),
            wal_fsync_policy: FsyncPolicy::PerOperation,
            checkpoint_operations_threshold: limits::DEFAULT_CHECKPOINT_OPS,
            checkpoint_bytes_threshold: limits::DEFAULT_CHECKPOINT_BYTES,
            checkpoint_interval: limits::DEFAULT_CHECKPOINT_INTERVAL,
            string_cache_size: limits::DEFAULT_STRING_CACHE_ENTRIES,
            string_cache_memory_limit: limits::DEFAULT_STRING_CACHE_BYTES,
            entity_cache_size: limits::DEFAULT_ENTITY_CACHE_ENTRIES,
            entity_cache_memory_limit: limits::DEFAULT_ENTITY_CACHE_BYTES,
            index_shard_count: limits::DEFAULT_INDEX_SHARDS,
            memory_high_pressure_threshold: 0.80,
            memory_critical_threshold: 0.90,
            memory_sample_interval: limits::DEFAULT_MEMORY_SAMPLE_INTERVAL,
            content_compression_threshold: limits::DEFAULT_COMPRESSION_THRESHOLD,
            content_chunk_threshold: limits::DEFAULT_CHUNK_THRESHOLD,
            retention_default_max_age: Duration::from_secs(30 * 24 * 3600),
            retention_default_max_tags: 500,
            deletion_collector_enabled: true,
            deletion_collector_interval: Duration::from_secs(3600),
            deletion_collector_batch_size: 100,
            deletion_collector_concurrency: 4,
            deletion_collector_dry_run: false,
            recovery_policy_mode: RecoveryPolicyMode::Permissive,
            metrics_globally_enabled: true,
        }
    }
}

/// Optional overrides for the flag tier; every field defaults to "leave
/// alone". Deserializable from `entitydb.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    /// Database file path.
    pub database_file: Option<PathBuf>,
    /// Fsync policy string (`per-op`, `per-<N>`, `periodic-<ms>`).
    pub wal_fsync_policy: Option<String>,
    /// Checkpoint operation threshold.
    pub checkpoint_operations_threshold: Option<u64>,
    /// Checkpoint byte threshold.
    pub checkpoint_bytes_threshold: Option<u64>,
    /// Checkpoint interval in seconds.
    pub checkpoint_interval_secs: Option<u64>,
    /// Interner entry cap.
    pub string_cache_size: Option<usize>,
    /// Interner byte cap.
    pub string_cache_memory_limit: Option<u64>,
    /// Entity cache entry cap.
    pub entity_cache_size: Option<usize>,
    /// Entity cache byte cap.
    pub entity_cache_memory_limit: Option<u64>,
    /// Index shard count.
    pub index_shard_count: Option<usize>,
    /// High-pressure memory fraction.
    pub memory_high_pressure_threshold: Option<f64>,
    /// Critical memory fraction.
    pub memory_critical_threshold: Option<f64>,
    /// Memory sampling interval in seconds.
    pub memory_sample_interval_secs: Option<u64>,
    /// Compression threshold in bytes.
    pub content_compression_threshold: Option<u64>,
    /// Chunk threshold in bytes.
    pub content_chunk_threshold: Option<u64>,
    /// Default retention age in seconds.
    pub retention_default_max_age_secs: Option<u64>,
    /// Default retention tag cap.
    pub retention_default_max_tags: Option<usize>,
    /// Collector enabled.
    pub deletion_collector_enabled: Option<bool>,
    /// Collector interval in seconds.
    pub deletion_collector_interval_secs: Option<u64>,
    /// Collector batch size.
    pub deletion_collector_batch_size: Option<usize>,
    /// Collector worker count.
    pub deletion_collector_concurrency: Option<usize>,
    /// Collector dry-run.
    pub deletion_collector_dry_run: Option<bool>,
    /// Recovery mode (`strict` | `permissive`).
    pub recovery_policy_mode: Option<String>,
    /// Metrics master switch.
    pub metrics_globally_enabled: Option<bool>,
}

impl ConfigOverrides {
    /// Parse overrides from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::invalid_input(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::invalid_input(format!("cannot parse {}: {}", path.display(), e)))
    }
}

/// Parse a fsync-policy string: `per-op`, `per-<N>`, `periodic-<ms>`.
pub fn parse_fsync_policy(s: &str) -> Result<FsyncPolicy> {
    if s == "per-op" {
        return Ok(FsyncPolicy::PerOperation);
    }
    if let Some(n) = s.strip_prefix("per-") {
        let n: u32 = n
            .parse()
            .map_err(|_| Error::invalid_input(format!("bad fsync batch size in '{}'", s)))?;
        if n == 0 {
            return Err(Error::invalid_input("fsync batch size must be > 0"));
        }
        return Ok(FsyncPolicy::EveryN(n));
    }
    if let Some(ms) = s.strip_prefix("periodic-") {
        let ms: u64 = ms
            .parse()
            .map_err(|_| Error::invalid_input(format!("bad fsync interval in '{}'", s)))?;
        return Ok(FsyncPolicy::Periodic(Duration::from_millis(ms)));
    }
    Err(Error::invalid_input(format!(
        "unknown fsync policy '{}'; expected per-op, per-<N>, or periodic-<ms>",
        s
    )))
}

fn parse_recovery_mode(s: &str) -> Result<RecoveryPolicyMode> {
    match s {
        "strict" => Ok(RecoveryPolicyMode::Strict),
        "permissive" => Ok(RecoveryPolicyMode::Permissive),
        other => Err(Error::invalid_input(format!(
            "unknown recovery policy mode '{}'; expected strict or permissive",
            other
        ))),
    }
}

impl EngineConfig {
    /// Resolve the environment and override tiers.
    ///
    /// Stored-config (the strongest tier) is applied later by the
    /// repository once the database is open, via `apply_config_entity`.
    pub fn resolve(overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = EngineConfig::default();
        config.apply_env()?;
        config.apply_overrides(overrides)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("ENTITYDB_DATABASE_FILE") {
            self.database_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ENTITYDB_WAL_FSYNC_POLICY") {
            self.wal_fsync_policy = parse_fsync_policy(&v)?;
        }
        if let Ok(v) = std::env::var("ENTITYDB_CHECKPOINT_OPERATIONS_THRESHOLD") {
            self.checkpoint_operations_threshold = parse_env(&v, "checkpoint ops threshold")?;
        }
        if let Ok(v) = std::env::var("ENTITYDB_CHECKPOINT_BYTES_THRESHOLD") {
            self.checkpoint_bytes_threshold = parse_env(&v, "checkpoint bytes threshold")?;
        }
        if let Ok(v) = std::env::var("ENTITYDB_CHECKPOINT_INTERVAL_SECS") {
            self.checkpoint_interval =
                Duration::from_secs(parse_env(&v, "checkpoint interval")?);
        }
        if let Ok(v) = std::env::var("ENTITYDB_INDEX_SHARD_COUNT") {
            self.index_shard_count = parse_env(&v, "index shard count")?;
        }
        if let Ok(v) = std::env::var("ENTITYDB_ENTITY_CACHE_SIZE") {
            self.entity_cache_size = parse_env(&v, "entity cache size")?;
        }
        if let Ok(v) = std::env::var("ENTITYDB_ENTITY_CACHE_MEMORY_LIMIT") {
            self.entity_cache_memory_limit = parse_env(&v, "entity cache memory limit")?;
        }
        if let Ok(v) = std::env::var("ENTITYDB_METRICS_GLOBALLY_ENABLED") {
            self.metrics_globally_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("ENTITYDB_RECOVERY_POLICY_MODE") {
            self.recovery_policy_mode = parse_recovery_mode(&v)?;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, o: &ConfigOverrides) -> Result<()> {
        if let Some(v) = &o.database_file {
            self.database_file = v.clone();
        }
        if let Some(v) = &o.wal_fsync_policy {
            self.wal_fsync_policy = parse_fsync_policy(v)?;
        }
        if let Some(v) = o.checkpoint_operations_threshold {
            self.checkpoint_operations_threshold = v;
        }
        if let Some(v) = o.checkpoint_bytes_threshold {
            self.checkpoint_bytes_threshold = v;
        }
        if let Some(v) = o.checkpoint_interval_secs {
            self.checkpoint_interval = Duration::from_secs(v);
        }
        if let Some(v) = o.string_cache_size {
            self.string_cache_size = v;
        }
        if let Some(v) = o.string_cache_memory_limit {
            self.string_cache_memory_limit = v;
        }
        if let Some(v) = o.entity_cache_size {
            self.entity_cache_size = v;
        }
        if let Some(v) = o.entity_cache_memory_limit {
            self.entity_cache_memory_limit = v;
        }
        if let Some(v) = o.index_shard_count {
            self.index_shard_count = v;
        }
        if let Some(v) = o.memory_high_pressure_threshold {
            self.memory_high_pressure_threshold = v;
        }
        if let Some(v) = o.memory_critical_threshold {
            self.memory_critical_threshold = v;
        }
        if let Some(v) = o.memory_sample_interval_secs {
            self.memory_sample_interval = Duration::from_secs(v);
        }
        if let Some(v) = o.content_compression_threshold {
            self.content_compression_threshold = v;
        }
        if let Some(v) = o.content_chunk_threshold {
            self.content_chunk_threshold = v;
        }
        if let Some(v) = o.retention_default_max_age_secs {
            self.retention_default_max_age = Duration::from_secs(v);
        }
        if let Some(v) = o.retention_default_max_tags {
            self.retention_default_max_tags = v;
        }
        if let Some(v) = o.deletion_collector_enabled {
            self.deletion_collector_enabled = v;
        }
        if let Some(v) = o.deletion_collector_interval_secs {
            self.deletion_collector_interval = Duration::from_secs(v);
        }
        if let Some(v) = o.deletion_collector_batch_size {
            self.deletion_collector_batch_size = v;
        }
        if let Some(v) = o.deletion_collector_concurrency {
            self.deletion_collector_concurrency = v;
        }
        if let Some(v) = o.deletion_collector_dry_run {
            self.deletion_collector_dry_run = v;
        }
        if let Some(v) = &o.recovery_policy_mode {
            self.recovery_policy_mode = parse_recovery_mode(v)?;
        }
        if let Some(v) = o.metrics_globally_enabled {
            self.metrics_globally_enabled = v;
        }
        Ok(())
    }

    /// Apply the stored-config tier from a `type:config` entity.
    ///
    /// Settings are tags of the form `config:<key>:<value>`; the latest tag
    /// per key wins, like any other namespace. Unknown keys warn and are
    /// kept for forward compatibility.
    pub fn apply_config_entity(&mut self, entity: &Entity) -> Result<()> {
        for tag in entity.current_tags() {
            let Some(key) = tag.namespace.strip_prefix("config:") else {
                continue;
            };
            let value = tag.value.as_str();
            match key {
                "wal_fsync_policy" => self.wal_fsync_policy = parse_fsync_policy(value)?,
                "checkpoint_operations_threshold" => {
                    self.checkpoint_operations_threshold = parse_env(value, key)?
                }
                "checkpoint_bytes_threshold" => {
                    self.checkpoint_bytes_threshold = parse_env(value, key)?
                }
                "checkpoint_interval_secs" => {
                    self.checkpoint_interval = Duration::from_secs(parse_env(value, key)?)
                }
                "entity_cache_size" => self.entity_cache_size = parse_env(value, key)?,
                "entity_cache_memory_limit" => {
                    self.entity_cache_memory_limit = parse_env(value, key)?
                }
                "string_cache_size" => self.string_cache_size = parse_env(value, key)?,
                "string_cache_memory_limit" => {
                    self.string_cache_memory_limit = parse_env(value, key)?
                }
                "content_compression_threshold" => {
                    self.content_compression_threshold = parse_env(value, key)?
                }
                "content_chunk_threshold" => {
                    self.content_chunk_threshold = parse_env(value, key)?
                }
                "retention_default_max_age_secs" => {
                    self.retention_default_max_age = Duration::from_secs(parse_env(value, key)?)
                }
                "retention_default_max_tags" => {
                    self.retention_default_max_tags = parse_env(value, key)?
                }
                "deletion_collector_enabled" => {
                    self.deletion_collector_enabled = value == "true" || value == "1"
                }
                "deletion_collector_dry_run" => {
                    self.deletion_collector_dry_run = value == "true" || value == "1"
                }
                "metrics_globally_enabled" => {
                    self.metrics_globally_enabled = value == "true" || value == "1"
                }
                "recovery_policy_mode" => {
                    self.recovery_policy_mode = parse_recovery_mode(value)?
                }
                other => warn!(key = other, "ignoring unknown stored config key"),
            }
        }
        Ok(())
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !self.index_shard_count.is_power_of_two()
            || !(entitydb_storage::MIN_SHARDS..=entitydb_storage::MAX_SHARDS)
                .contains(&self.index_shard_count)
        {
            return Err(Error::invalid_input(format!(
                "index_shard_count must be a power of two in {}..={}",
                entitydb_storage::MIN_SHARDS,
                entitydb_storage::MAX_SHARDS
            )));
        }
        if self.memory_high_pressure_threshold >= self.memory_critical_threshold {
            return Err(Error::invalid_input(
                "memory_high_pressure_threshold must be below memory_critical_threshold"
                    .to_string(),
            ));
        }
        if self.content_compression_threshold > self.content_chunk_threshold {
            return Err(Error::invalid_input(
                "content_compression_threshold must not exceed content_chunk_threshold"
                    .to_string(),
            ));
        }
        if self.deletion_collector_concurrency == 0 {
            return Err(Error::invalid_input(
                "deletion_collector_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::invalid_input(format!("cannot parse {} from '{}'", what, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitydb_core::{Content, EntityId, TemporalTag, Timestamp};

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn fsync_policy_grammar() {
        assert_eq!(parse_fsync_policy("per-op").unwrap(), FsyncPolicy::PerOperation);
        assert_eq!(parse_fsync_policy("per-64").unwrap(), FsyncPolicy::EveryN(64));
        assert_eq!(
            parse_fsync_policy("periodic-250").unwrap(),
            FsyncPolicy::Periodic(Duration::from_millis(250))
        );
        assert!(parse_fsync_policy("per-0").is_err());
        assert!(parse_fsync_policy("sometimes").is_err());
    }

    #[test]
    fn overrides_beat_defaults() {
        let overrides = ConfigOverrides {
            entity_cache_size: Some(123),
            checkpoint_interval_secs: Some(10),
            wal_fsync_policy: Some("per-8".to_string()),
            ..Default::default()
        };
        let config = EngineConfig::resolve(&overrides).unwrap();
        assert_eq!(config.entity_cache_size, 123);
        assert_eq!(config.checkpoint_interval, Duration::from_secs(10));
        assert_eq!(config.wal_fsync_policy, FsyncPolicy::EveryN(8));
    }

    #[test]
    fn toml_overrides_parse() {
        let overrides: ConfigOverrides = toml::from_str(
            r#"
entity_cache_size = 500
deletion_collector_dry_run = true
recovery_policy_mode = "strict"
"#,
        )
        .unwrap();
        let config = EngineConfig::resolve(&overrides).unwrap();
        assert_eq!(config.entity_cache_size, 500);
        assert!(config.deletion_collector_dry_run);
        assert_eq!(config.recovery_policy_mode, RecoveryPolicyMode::Strict);
    }

    #[test]
    fn unknown_toml_key_is_rejected() {
        let parsed: std::result::Result<ConfigOverrides, _> =
            toml::from_str("no_such_option = 1");
        assert!(parsed.is_err());
    }

    #[test]
    fn stored_config_entity_wins() {
        let mut config = EngineConfig::default();
        let entity = Entity::new(
            EntityId::generate(),
            vec![
                TemporalTag::new(Timestamp::from_nanos(1), "type", "config"),
                TemporalTag::new(Timestamp::from_nanos(1), "dataset", "system"),
                TemporalTag::new(Timestamp::from_nanos(1), "created_by", "admin"),
                TemporalTag::new(
                    Timestamp::from_nanos(2),
                    "config:entity_cache_size",
                    "9999",
                ),
                TemporalTag::new(
                    Timestamp::from_nanos(2),
                    "config:metrics_globally_enabled",
                    "false",
                ),
            ],
            Content::Empty,
        )
        .unwrap();

        config.apply_config_entity(&entity).unwrap();
        assert_eq!(config.entity_cache_size, 9999);
        assert!(!config.metrics_globally_enabled);
    }

    #[test]
    fn stored_config_latest_value_wins() {
        let mut config = EngineConfig::default();
        let entity = Entity::new(
            EntityId::generate(),
            vec![
                TemporalTag::new(Timestamp::from_nanos(1), "type", "config"),
                TemporalTag::new(
                    Timestamp::from_nanos(2),
                    "config:entity_cache_size",
                    "100",
                ),
                TemporalTag::new(
                    Timestamp::from_nanos(3),
                    "config:entity_cache_size",
                    "200",
                ),
            ],
            Content::Empty,
        )
        .unwrap();
        config.apply_config_entity(&entity).unwrap();
        assert_eq!(config.entity_cache_size, 200);
    }

    #[test]
    fn validation_rejects_bad_shard_count() {
        let mut config = EngineConfig::default();
        config.index_shard_count = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_inverted_pressure_thresholds() {
        let mut config = EngineConfig::default();
        config.memory_high_pressure_threshold = 0.95;
        assert!(config.validate().is_err());
    }
}
