//! Memory-mapped read path
//!
//! The data section is mapped read-only and parsed lazily: opening the map
//! scans record frames (ids and lengths only) to build the offset index,
//! and full decoding happens per read. Small inline content is served as a
//! view over mapped memory; compressed content is inflated lazily by the
//! repository when the caller asks for bytes.
//!
//! Readers never block writers: mutations land in the WAL and the dirty
//! store, and a checkpoint swaps in a whole new file while existing maps
//! stay valid on the old inode.

use crate::format::header::FileHeader;
use crate::format::record::{decode_record, frame_at};
use entitydb_core::{Entity, EntityId, Error, Result};
use memmap2::Mmap;
use rustc_hash::FxHashMap;
use std::fs::File;
use tracing::{info, warn};

/// Read-only view over the data section of a unified file.
pub struct MappedReader {
    mmap: Mmap,
    data_offset: u64,
    data_length: u64,
    /// id → (absolute offset, record length)
    offsets: FxHashMap<EntityId, (u64, u64)>,
    /// Legacy ids rewritten while scanning; checkpoint persists the rewrite.
    migrated: u64,
}

impl MappedReader {
    /// Map a unified file and scan the data section's record frames.
    ///
    /// The scan reads only each record's fixed prefix, so it is O(records)
    /// with no tag or content decoding.
    ///
    /// # Errors
    ///
    /// `IntegrityViolation` when a record frame runs past the section — the
    /// data section cannot be trusted and the caller should fall back to
    /// recovery.
    pub fn map(file: &File, header: &FileHeader) -> Result<Self> {
        // SAFETY: the map is read-only and the engine holds an exclusive
        // lock on the file, so no other process truncates it underneath us.
        // Checkpoints replace the file by rename, leaving this inode intact.
        let mmap = unsafe { Mmap::map(file) }.map_err(Error::from)?;

        let data_end = header.data_offset + header.data_length;
        if (mmap.len() as u64) < data_end {
            return Err(Error::IntegrityViolation(
                "file shorter than its data section".to_string(),
            ));
        }

        let mut offsets = FxHashMap::default();
        let mut migrated = 0u64;
        let mut pos = header.data_offset;
        while pos < data_end {
            let frame = frame_at(&mmap[..data_end as usize], pos)?;
            if frame.migrated {
                migrated += 1;
            }
            offsets.insert(frame.id, (frame.offset, frame.len));
            pos += frame.len;
        }

        if migrated > 0 {
            info!(migrated, "rewrote legacy entity ids while scanning data section");
        }
        Ok(MappedReader {
            mmap,
            data_offset: header.data_offset,
            data_length: header.data_length,
            offsets,
            migrated,
        })
    }

    /// Decode one entity by id.
    ///
    /// Returns `Ok(None)` when the id has no record. Checksum failures
    /// surface as `Corrupted` for the recovery manager to act on.
    pub fn get(&self, id: &EntityId) -> Result<Option<Entity>> {
        match self.offsets.get(id) {
            Some((offset, _len)) => decode_record(&self.mmap, *offset).map(Some),
            None => Ok(None),
        }
    }

    /// True when a record exists for the id.
    pub fn contains(&self, id: &EntityId) -> bool {
        self.offsets.contains_key(id)
    }

    /// Number of records in the data section.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// True when the data section holds no records.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Ids of every record in the data section.
    pub fn ids(&self) -> Vec<EntityId> {
        self.offsets.keys().copied().collect()
    }

    /// Count of legacy ids rewritten during the frame scan.
    pub fn migrated_count(&self) -> u64 {
        self.migrated
    }

    /// Decode every record, skipping corrupt ones.
    ///
    /// Used by checkpoint merge and index rebuild. Corrupt records are
    /// reported, not silently dropped into the output.
    pub fn iter_entities(&self) -> (Vec<Entity>, u64) {
        let mut out = Vec::with_capacity(self.offsets.len());
        let mut corrupt = 0u64;
        for (offset, _len) in self.offsets.values() {
            match decode_record(&self.mmap, *offset) {
                Ok(entity) => out.push(entity),
                Err(e) => {
                    warn!(error = %e, "skipping corrupt record during data-section iteration");
                    corrupt += 1;
                }
            }
        }
        (out, corrupt)
    }

    /// Exhaustive scan for one id, ignoring the offset index.
    ///
    /// Recovery's last-resort strategy: walks the section record by record
    /// so a poisoned offset index cannot hide a live record.
    pub fn scan_for(&self, id: &EntityId) -> Option<Entity> {
        let data_end = self.data_offset + self.data_length;
        let mut pos = self.data_offset;
        while pos < data_end {
            let frame = match frame_at(&self.mmap[..data_end as usize], pos) {
                Ok(frame) => frame,
                Err(_) => return None,
            };
            if &frame.id == id {
                return decode_record(&self.mmap, pos).ok();
            }
            pos += frame.len;
        }
        None
    }
}

impl std::fmt::Debug for MappedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedReader")
            .field("records", &self.offsets.len())
            .field("data_length", &self.data_length)
            .finish()
    }
}
