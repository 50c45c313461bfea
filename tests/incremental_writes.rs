//! Writes between checkpoints touch O(1) disk regions: the WAL tail only.
//! The data section must never be rewritten by an individual mutation.

use entitydb::{EngineConfig, EntityDb, EntityId, UnifiedFile};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.database_file = dir.path().join("incremental.edb");
    config.index_shard_count = 16;
    config.checkpoint_operations_threshold = u64::MAX;
    config.checkpoint_bytes_threshold = u64::MAX;
    config.checkpoint_interval = std::time::Duration::from_secs(3600);
    config.deletion_collector_enabled = false;
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
fn updates_grow_only_the_wal_tail() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let path = config.database_file.clone();

    let db = EntityDb::open(config.clone()).unwrap();
    let repo = db.repository();

    // A populated, checkpointed baseline
    let mut ids = Vec::new();
    for _ in 0..50 {
        let id = EntityId::generate();
        repo.create(id, mandatory_tags(), None, "u001").unwrap();
        ids.push(id);
    }
    repo.checkpoint().unwrap();

    let after_checkpoint = std::fs::metadata(&path).unwrap().len();
    let baseline_data = {
        // Snapshot the data-section bytes to prove they stay untouched
        std::fs::read(&path).unwrap()
    };

    // Mutations against the checkpointed corpus
    let target = ids[25];
    for i in 0..20 {
        repo.add_tag(&target, &format!("progress:step{}", i)).unwrap();
    }
    repo.update(&target, vec!["status:done".to_string()], None, "u001")
        .unwrap();

    let after_writes = std::fs::read(&path).unwrap();
    // File only grew
    assert!(after_writes.len() as u64 > after_checkpoint);
    // Everything up to the old end is byte-identical: header, data
    // section, and index section were not rewritten
    assert_eq!(
        &after_writes[..after_checkpoint as usize],
        &baseline_data[..after_checkpoint as usize]
    );

    // Growth is proportional to the 21 logged operations, not to the
    // corpus size
    let growth = after_writes.len() as u64 - after_checkpoint;
    assert!(
        growth < after_checkpoint / 2,
        "WAL growth {} looks like a data-section rewrite of a {} byte file",
        growth,
        after_checkpoint
    );

    drop(baseline_data);
    db.close().unwrap();
}

#[test]
fn header_entity_count_matches_index_after_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let path = config.database_file.clone();

    let db = EntityDb::open(config.clone()).unwrap();
    let repo = db.repository();
    for _ in 0..30 {
        repo.create(EntityId::generate(), mandatory_tags(), None, "u001")
            .unwrap();
    }
    let deleted = EntityId::generate();
    repo.create(deleted, mandatory_tags(), None, "u001").unwrap();
    repo.delete(&deleted).unwrap();

    repo.checkpoint().unwrap();
    assert_eq!(repo.entity_count(), 30);
    db.close().unwrap();

    let unified = UnifiedFile::open(&path).unwrap();
    assert_eq!(unified.header().entity_count, 30);
    assert_eq!(unified.header().wal_length, 0);
}

#[test]
fn deleted_entity_space_reclaimed_at_checkpoint() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    // Keep the payload inline so the record's on-disk size is its real size
    config.content_compression_threshold = 10 * 1024 * 1024;
    config.content_chunk_threshold = 20 * 1024 * 1024;
    let path = config.database_file.clone();

    let db = EntityDb::open(config.clone()).unwrap();
    let repo = db.repository();

    let big = EntityId::generate();
    repo.create(
        big,
        mandatory_tags(),
        Some(vec![0xAB; 64 * 1024]),
        "u001",
    )
    .unwrap();
    repo.checkpoint().unwrap();
    let with_big = std::fs::metadata(&path).unwrap().len();

    repo.delete(&big).unwrap();
    // Tombstoned but not yet reclaimed
    assert!(std::fs::metadata(&path).unwrap().len() >= with_big);

    repo.checkpoint().unwrap();
    let after_reclaim = std::fs::metadata(&path).unwrap().len();
    assert!(
        after_reclaim < with_big,
        "checkpoint did not reclaim the deleted record ({} -> {})",
        with_big,
        after_reclaim
    );
    db.close().unwrap();
}
