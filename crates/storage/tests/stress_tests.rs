//! Concurrency stress for the in-memory storage layer: sharded index under
//! parallel writers, cache bounds under churn, interner sharing under
//! contention.

use entitydb_core::{Content, Entity, EntityId, TemporalTag, Timestamp};
use entitydb_storage::{EntityCache, EntityStore, ShardedTagIndex, StringInterner};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn entity(seq: u64) -> Arc<Entity> {
    Arc::new(
        Entity::new(
            EntityId::generate(),
            vec![
                TemporalTag::new(Timestamp::from_nanos(seq), "type", "task"),
                TemporalTag::new(Timestamp::from_nanos(seq), "dataset", "ops"),
                TemporalTag::new(Timestamp::from_nanos(seq), "created_by", "u001"),
            ],
            Content::Empty,
        )
        .unwrap(),
    )
}

#[test]
fn index_handles_parallel_writers_and_readers() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let index = Arc::new(ShardedTagIndex::new(64).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                let mut ids = Vec::with_capacity(PER_THREAD);
                for i in 0..PER_THREAD {
                    let id = EntityId::generate();
                    index.insert("type:task", id);
                    index.insert(&format!("dataset:shard{}", t), id);
                    index.insert(&format!("seq:{}", i), id);
                    // Interleave reads with writes
                    assert!(!index.lookup("type:task").is_empty());
                    ids.push(id);
                }
                ids
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    assert_eq!(index.lookup("type:task").len(), THREADS * PER_THREAD);
    assert_eq!(index.entity_count(), THREADS * PER_THREAD);
    for t in 0..THREADS {
        assert_eq!(
            index.lookup(&format!("dataset:shard{}", t)).len(),
            PER_THREAD
        );
    }
    // Every seq tag is shared by one entity per thread
    assert_eq!(index.lookup("seq:0").len(), THREADS);

    // Removal drains cleanly
    for id in &all {
        index.remove("type:task", id);
    }
    assert!(index.lookup("type:task").is_empty());
}

#[test]
fn snapshot_under_concurrent_mutation_is_well_formed() {
    let index = Arc::new(ShardedTagIndex::new(16).unwrap());

    let writer_index = Arc::clone(&index);
    let writer = std::thread::spawn(move || {
        for i in 0..2000 {
            writer_index.insert(&format!("label:v{}", i % 50), EntityId::generate());
        }
    });

    // Snapshots taken mid-mutation must stay internally consistent
    for _ in 0..20 {
        let snapshot = index.snapshot();
        assert_eq!(snapshot.len(), 16);
        for shard in &snapshot {
            for (tag, ids) in shard {
                assert!(tag.starts_with("label:"));
                assert!(!ids.is_empty());
            }
        }
    }
    writer.join().unwrap();
}

#[test]
fn cache_stays_bounded_under_churn() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 1000;
    const CAP: usize = 64;

    let cache = Arc::new(EntityCache::new(CAP, 1 << 30));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let e = entity((t * PER_THREAD + i) as u64);
                    let id = e.id;
                    cache.insert(e);
                    cache.get(&id);
                    if i % 3 == 0 {
                        cache.invalidate(&id);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(cache.len() <= CAP);
    let (hits, _misses, evictions, invalidations) = cache.counters().snapshot();
    assert!(hits > 0);
    assert!(evictions > 0);
    assert!(invalidations > 0);
}

#[test]
fn interner_shares_across_threads() {
    const THREADS: usize = 8;

    let interner = Arc::new(StringInterner::new(1000, 1 << 20));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let interner = Arc::clone(&interner);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let handle = interner.intern("type:task");
                    assert_eq!(&*handle, "type:task");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // One distinct string, many hits
    assert_eq!(interner.len(), 1);
    let hits = interner.counters().hits.load(Ordering::Relaxed);
    assert!(hits >= (THREADS * 1000 - THREADS) as u64);
}

#[test]
fn store_tracks_dirty_set_under_parallel_writes() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 250;

    let store = Arc::new(EntityStore::new());
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let e = entity((t * PER_THREAD + i) as u64);
                    let id = e.id;
                    store.put(e);
                    if i % 5 == 0 {
                        store.tombstone(id);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.len(), THREADS * PER_THREAD);
    assert_eq!(store.tombstoned_ids().len(), THREADS * (PER_THREAD / 5));
    assert_eq!(
        store.written_ids().len(),
        THREADS * (PER_THREAD - PER_THREAD / 5)
    );
}
