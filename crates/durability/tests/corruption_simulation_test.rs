//! Corruption simulation against the unified file
//!
//! Flips bytes in each section of a real `.edb` file and checks that every
//! damage class is detected, reported, and contained: nothing corrupt is
//! ever silently accepted, and damage in one record never takes down its
//! neighbors.

use entitydb_core::{Content, Entity, EntityId, Error, TemporalTag, Timestamp};
use entitydb_durability::{
    write_checkpoint, FileHeader, FsyncPolicy, MappedReader, UnifiedFile, WalPayload, WalReader,
    WalWriter, HEADER_SIZE,
};
use tempfile::tempdir;

fn entity(n: u64) -> Entity {
    Entity::new(
        EntityId::generate(),
        vec![
            TemporalTag::new(Timestamp::from_nanos(n), "type", "task"),
            TemporalTag::new(Timestamp::from_nanos(n), "dataset", "ops"),
            TemporalTag::new(Timestamp::from_nanos(n), "created_by", "u001"),
        ],
        Content::Inline(vec![n as u8; 32]),
    )
    .unwrap()
}

/// Build a checkpointed file with `count` entities, then drop all handles.
fn build_db(path: &std::path::Path, count: u64) -> Vec<Entity> {
    UnifiedFile::create(path).unwrap();
    let entities: Vec<Entity> = (0..count).map(entity).collect();
    let ids: Vec<EntityId> = entities.iter().map(|e| e.id).collect();
    let mut snapshot = vec![Vec::new(); 16];
    snapshot[0].push(("type:task".to_string(), ids));
    write_checkpoint(path, &entities, &snapshot, Timestamp::from_nanos(1)).unwrap();
    entities
}

#[test]
fn flipped_bit_in_header_fails_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.edb");
    build_db(&path, 3);

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[40] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let err = UnifiedFile::open(&path).unwrap_err();
    assert!(matches!(err, Error::IntegrityViolation(_)));
}

#[test]
fn flipped_bit_in_one_record_leaves_others_readable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.edb");
    let entities = build_db(&path, 5);

    let unified = UnifiedFile::open(&path).unwrap();
    let header = *unified.header();
    drop(unified);

    // Locate the third record's frame and corrupt a byte in its tag
    // section, leaving the framing fields intact
    let mut bytes = std::fs::read(&path).unwrap();
    let data_end = (header.data_offset + header.data_length) as usize;
    let mut offset = header.data_offset;
    for _ in 0..2 {
        let frame = entitydb_durability::frame_at(&bytes[..data_end], offset).unwrap();
        offset += frame.len;
    }
    bytes[offset as usize + 80] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let file = std::fs::File::open(&path).unwrap();
    let reader = MappedReader::map(&file, &header).unwrap();

    let mut corrupt_count = 0;
    let mut ok_count = 0;
    for e in &entities {
        match reader.get(&e.id) {
            Ok(Some(found)) => {
                assert_eq!(&found, e);
                ok_count += 1;
            }
            Err(Error::Corrupted { .. }) => corrupt_count += 1,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
    assert_eq!(corrupt_count, 1, "exactly one record should be damaged");
    assert_eq!(ok_count, 4);
}

#[test]
fn wal_mid_record_corruption_skips_only_that_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wal.edb");
    let file = std::fs::File::options()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let writer = WalWriter::new(file, 0, 0, 1, FsyncPolicy::PerOperation);

    let ids: Vec<EntityId> = (0..3).map(|_| EntityId::generate()).collect();
    let mut offsets = Vec::new();
    for id in &ids {
        offsets.push(std::fs::metadata(&path).unwrap().len());
        writer
            .append(
                Timestamp::now(),
                *id,
                WalPayload::AddTag {
                    tag: TemporalTag::new(Timestamp::now(), "status", "open"),
                },
            )
            .unwrap();
    }
    drop(writer);

    // Damage the middle record's payload
    let mut bytes = std::fs::read(&path).unwrap();
    let target = offsets[1] as usize + 60;
    bytes[target] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let result = WalReader::read_region(&std::fs::read(&path).unwrap());
    assert_eq!(result.skipped, 1);
    assert_eq!(result.records.len(), 2);
    assert_eq!(result.records[0].entity_id, ids[0]);
    assert_eq!(result.records[1].entity_id, ids[2]);
    assert!(!result.truncated);
}

#[test]
fn wal_truncated_tail_stops_cleanly() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wal.edb");
    let file = std::fs::File::options()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let writer = WalWriter::new(file, 0, 0, 1, FsyncPolicy::PerOperation);
    for _ in 0..3 {
        writer
            .append(
                Timestamp::now(),
                EntityId::generate(),
                WalPayload::Delete,
            )
            .unwrap();
    }
    drop(writer);

    // Cut the file mid-way through the last record
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_len(len - 10).unwrap();
    drop(file);

    let result = WalReader::read_region(&std::fs::read(&path).unwrap());
    assert_eq!(result.records.len(), 2);
    assert!(result.truncated);
    assert_eq!(result.skipped, 0);
}

#[test]
fn index_section_damage_is_detected_not_trusted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.edb");
    build_db(&path, 4);

    let mut unified = UnifiedFile::open(&path).unwrap();
    let header = *unified.header();
    assert!(header.index_length > 0);
    drop(unified);

    let mut bytes = std::fs::read(&path).unwrap();
    let mid_index = header.index_offset as usize + (header.index_length as usize / 2);
    bytes[mid_index] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    unified = UnifiedFile::open(&path).unwrap();
    let section = unified.read_index_section().unwrap();
    // The section either fails to parse (detected) or the data section
    // remains the real source of truth for a rebuild
    if entitydb_durability::decode_index(&section).is_ok() {
        let reader = MappedReader::map(&unified.try_clone().unwrap(), &header).unwrap();
        assert_eq!(reader.len(), 4);
    }
}

#[test]
fn fresh_file_has_consistent_empty_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.edb");
    let unified = UnifiedFile::create(&path).unwrap();
    let header: &FileHeader = unified.header();
    assert_eq!(header.entity_count, 0);
    assert_eq!(header.data_length, 0);
    assert_eq!(header.wal_offset, HEADER_SIZE as u64);
}
