//! Crash-restart durability: entities whose create returned successfully
//! must survive an unclean shutdown, and damaged records must never be
//! silently accepted.

use entitydb::{EngineConfig, EntityDb, EntityId, FsyncPolicy};
use rand::{distributions::Alphanumeric, Rng, SeedableRng};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.database_file = dir.path().join("crash.edb");
    config.index_shard_count = 16;
    config.wal_fsync_policy = FsyncPolicy::PerOperation;
    config.checkpoint_operations_threshold = u64::MAX;
    config.checkpoint_bytes_threshold = u64::MAX;
    config.checkpoint_interval = std::time::Duration::from_secs(3600);
    config.deletion_collector_enabled = false;
    config.metrics_globally_enabled = false;
    config
}

fn random_tags(rng: &mut impl Rng) -> Vec<String> {
    let value: String = rng
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    vec![
        "type:task".to_string(),
        "dataset:ops".to_string(),
        "created_by:u001".to_string(),
        format!("label:{}", value),
    ]
}

#[test]
fn kill_without_shutdown_loses_nothing_acknowledged() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    let mut acknowledged = Vec::new();
    {
        let db = EntityDb::open(config.clone()).unwrap();
        let repo = db.repository();
        for _ in 0..500 {
            let id = EntityId::generate();
            repo.create(id, random_tags(&mut rng), None, "u001").unwrap();
            acknowledged.push(id);
        }
        // Half of them get a later mutation too
        for id in acknowledged.iter().step_by(2) {
            repo.add_tag(id, "status:open").unwrap();
        }
        // Kill: no checkpoint, no close, no drop
        db.abandon();
    }

    let db = EntityDb::open(config).unwrap();
    let repo = db.repository();
    for (i, id) in acknowledged.iter().enumerate() {
        let entity = repo
            .get(id)
            .unwrap_or_else(|e| panic!("entity {} lost after crash: {}", id, e));
        assert_eq!(entity.entity_type(), Some("task"));
        if i % 2 == 0 {
            assert_eq!(
                entity
                    .latest_in_namespace("status")
                    .map(|t| t.value.as_str()),
                Some("open")
            );
        }
    }
    assert_eq!(repo.entity_count(), acknowledged.len());
    db.close().unwrap();
}

#[test]
fn crash_after_checkpoint_replays_only_the_tail() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let mut rng = rand::rngs::StdRng::seed_from_u64(11);
    let mut before_checkpoint = Vec::new();
    let mut after_checkpoint = Vec::new();
    {
        let db = EntityDb::open(config.clone()).unwrap();
        let repo = db.repository();
        for _ in 0..100 {
            let id = EntityId::generate();
            repo.create(id, random_tags(&mut rng), None, "u001").unwrap();
            before_checkpoint.push(id);
        }
        repo.checkpoint().unwrap();
        for _ in 0..100 {
            let id = EntityId::generate();
            repo.create(id, random_tags(&mut rng), None, "u001").unwrap();
            after_checkpoint.push(id);
        }
        db.abandon();
    }

    let db = EntityDb::open(config).unwrap();
    let repo = db.repository();
    for id in before_checkpoint.iter().chain(after_checkpoint.iter()) {
        assert!(repo.get(id).is_ok(), "entity {} lost", id);
    }
    assert_eq!(repo.entity_count(), 200);
    db.close().unwrap();
}

#[test]
fn corrupted_wal_record_is_skipped_not_accepted() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let keep = EntityId::generate();
    let corrupt = EntityId::generate();
    {
        let db = EntityDb::open(config.clone()).unwrap();
        let repo = db.repository();
        repo.create(
            keep,
            vec![
                "type:task".to_string(),
                "dataset:ops".to_string(),
                "created_by:u001".to_string(),
            ],
            None,
            "u001",
        )
        .unwrap();
        repo.create(
            corrupt,
            vec![
                "type:task".to_string(),
                "dataset:ops".to_string(),
                "created_by:u001".to_string(),
            ],
            None,
            "u001",
        )
        .unwrap();
        db.abandon();
    }

    // Flip one byte in the tail of the file: the last WAL record's payload
    let path = dir.path().join("crash.edb");
    let mut bytes = std::fs::read(&path).unwrap();
    let at = bytes.len() - 20;
    bytes[at] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let db = EntityDb::open(config).unwrap();
    let repo = db.repository();
    // The undamaged record replayed
    assert!(repo.get(&keep).is_ok());
    // The damaged one is gone — never silently accepted with bad bytes
    assert!(repo.get(&corrupt).is_err());
    db.close().unwrap();
}

#[test]
fn reopen_after_clean_close_equals_pre_close_state() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let mut rng = rand::rngs::StdRng::seed_from_u64(23);

    let mut expected = Vec::new();
    {
        let db = EntityDb::open(config.clone()).unwrap();
        let repo = db.repository();
        for _ in 0..50 {
            let id = EntityId::generate();
            let entity = repo.create(id, random_tags(&mut rng), None, "u001").unwrap();
            expected.push((id, (*entity).clone()));
        }
        db.close().unwrap();
    }

    let db = EntityDb::open(config).unwrap();
    let repo = db.repository();
    for (id, before) in &expected {
        let after = repo.get(id).unwrap();
        assert_eq!(after.tags, before.tags);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.updated_at, before.updated_at);
    }
    db.close().unwrap();
}
