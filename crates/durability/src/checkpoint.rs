//! Checkpointing
//!
//! A checkpoint rewrites the data and index sections from the authoritative
//! in-memory state and truncates the WAL. The protocol never modifies the
//! live file in place:
//!
//! 1. write header + data + index to a shadow file, fsync
//! 2. atomically rename the shadow over the database path
//! 3. fsync the parent directory
//! 4. hand the (still-open, still-locked) shadow handle back to the caller,
//!    which swaps its WAL writer and mmap onto it
//!
//! Readers holding the previous mmap keep reading the old inode; new
//! readers map the new layout. The header's entity count is rederived here
//! from the index snapshot — never incremented independently — so header
//! and index cannot diverge.

use crate::format::header::{FileHeader, HEADER_SIZE};
use crate::format::index_section::{encode_index, IndexSnapshot};
use crate::format::record::encode_record;
use entitydb_core::{Entity, Error, Result, Timestamp};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Thresholds that make a checkpoint due. Any single one suffices.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointTriggers {
    /// WAL operation count threshold.
    pub ops_threshold: u64,
    /// WAL byte size threshold.
    pub bytes_threshold: u64,
    /// Elapsed time threshold.
    pub interval: Duration,
}

impl CheckpointTriggers {
    /// Whether any trigger has fired.
    pub fn due(&self, wal_ops: u64, wal_bytes: u64, elapsed: Duration) -> bool {
        wal_ops >= self.ops_threshold
            || wal_bytes >= self.bytes_threshold
            || elapsed >= self.interval
    }
}

impl Default for CheckpointTriggers {
    fn default() -> Self {
        CheckpointTriggers {
            ops_threshold: entitydb_core::limits::DEFAULT_CHECKPOINT_OPS,
            bytes_threshold: entitydb_core::limits::DEFAULT_CHECKPOINT_BYTES,
            interval: entitydb_core::limits::DEFAULT_CHECKPOINT_INTERVAL,
        }
    }
}

/// What a completed checkpoint wrote.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointOutcome {
    /// Live entities written to the data section (== header entity count).
    pub entity_count: u64,
    /// Data section bytes.
    pub data_length: u64,
    /// Index section bytes.
    pub index_length: u64,
}

/// Write a checkpoint to a shadow file and swap it over `path`.
///
/// `entities` is the merged live set (data section ∪ dirty writes −
/// tombstones); `index` is the matching tag-index snapshot. Returns the new
/// file handle (exclusively locked) and its header.
///
/// # Errors
///
/// Any I/O failure leaves the original file untouched; the shadow file is
/// removed on a best-effort basis.
pub fn write_checkpoint(
    path: &Path,
    entities: &[Entity],
    index: &IndexSnapshot,
    at: Timestamp,
) -> Result<(File, FileHeader, CheckpointOutcome)> {
    let shadow_path = path.with_extension("edb.ckpt");

    let result = write_shadow(&shadow_path, entities, index, at);
    let (file, header, outcome) = match result {
        Ok(parts) => parts,
        Err(e) => {
            let _ = std::fs::remove_file(&shadow_path);
            return Err(e);
        }
    };

    if let Err(e) = std::fs::rename(&shadow_path, path) {
        let _ = std::fs::remove_file(&shadow_path);
        return Err(e.into());
    }
    sync_parent_dir(path);

    info!(
        entities = outcome.entity_count,
        data_bytes = outcome.data_length,
        index_bytes = outcome.index_length,
        "checkpoint complete"
    );
    Ok((file, header, outcome))
}

fn write_shadow(
    shadow_path: &Path,
    entities: &[Entity],
    index: &IndexSnapshot,
    at: Timestamp,
) -> Result<(File, FileHeader, CheckpointOutcome)> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(shadow_path)?;
    file.try_lock_exclusive().map_err(|_| {
        Error::Transient("could not lock checkpoint shadow file".to_string())
    })?;

    // Data section
    file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
    let mut data_length = 0u64;
    for entity in entities {
        let record = encode_record(entity);
        file.write_all(&record)?;
        data_length += record.len() as u64;
    }

    // Index section
    let index_bytes = encode_index(index);
    file.write_all(&index_bytes)?;

    let data_offset = HEADER_SIZE as u64;
    let index_offset = data_offset + data_length;
    let wal_offset = index_offset + index_bytes.len() as u64;

    let header = FileHeader {
        format_version: crate::format::header::EUFF_FORMAT_VERSION,
        flags: 0,
        file_size: wal_offset,
        data_offset,
        data_length,
        index_offset,
        index_length: index_bytes.len() as u64,
        wal_offset,
        wal_length: 0,
        entity_count: entities.len() as u64,
        last_checkpoint: at,
    };

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.to_bytes())?;
    file.sync_all()?;

    debug!(
        entities = entities.len(),
        data_bytes = data_length,
        "checkpoint shadow written"
    );
    let outcome = CheckpointOutcome {
        entity_count: entities.len() as u64,
        data_length,
        index_length: index_bytes.len() as u64,
    };
    Ok((file, header, outcome))
}

fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
