//! WAL reader
//!
//! Reads the WAL region back for replay after a restart or crash. Replay
//! is deterministic: records apply in file order, which is sequence order.
//!
//! Damage handling:
//! - a checksum-failed record in the middle is skipped (its length field
//!   still frames it) and reported
//! - a partial record at the tail is the normal crash signature; replay
//!   stops there
//! - a structurally malformed record means framing can no longer be
//!   trusted; replay stops and reports truncation

use crate::format::wal_record::{WalRecord, WalRecordError};
use entitydb_core::Result;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use tracing::{info, warn};

/// Outcome of reading a WAL region.
#[derive(Debug)]
pub struct WalReadResult {
    /// Valid records in sequence order.
    pub records: Vec<WalRecord>,
    /// Checksum-failed records skipped mid-log.
    pub skipped: u64,
    /// True when replay stopped before the end of the region.
    pub truncated: bool,
    /// Bytes of the region that parsed cleanly (relative to region start).
    pub valid_len: u64,
}

impl WalReadResult {
    /// Highest sequence number seen, or `None` for an empty log.
    pub fn max_seq(&self) -> Option<u64> {
        self.records.iter().map(|r| r.seq).max()
    }
}

/// Reader over a WAL region.
pub struct WalReader;

impl WalReader {
    /// Parse every record in a WAL region buffer.
    pub fn read_region(buf: &[u8]) -> WalReadResult {
        let mut records = Vec::new();
        let mut skipped = 0u64;
        let mut pos = 0u64;
        let mut truncated = false;

        while (pos as usize) < buf.len() {
            match WalRecord::from_bytes(&buf[pos as usize..]) {
                Ok((record, consumed)) => {
                    records.push(record);
                    pos += consumed;
                }
                Err(WalRecordError::ChecksumMismatch { record_len }) => {
                    warn!(offset = pos, "skipping checksum-failed WAL record");
                    skipped += 1;
                    pos += record_len;
                }
                Err(WalRecordError::InsufficientData) => {
                    // Partial tail — the usual crash signature
                    truncated = true;
                    break;
                }
                Err(WalRecordError::Malformed(reason)) => {
                    warn!(offset = pos, reason, "malformed WAL record; stopping replay");
                    truncated = true;
                    break;
                }
            }
        }

        if truncated || skipped > 0 {
            info!(
                records = records.len(),
                skipped, truncated, "WAL region read with damage"
            );
        }
        WalReadResult {
            records,
            skipped,
            truncated,
            valid_len: pos,
        }
    }

    /// Read the WAL region of the unified file, from `wal_start` to EOF.
    pub fn read_from_file(file: &mut File, wal_start: u64) -> Result<WalReadResult> {
        let end = file.seek(SeekFrom::End(0))?;
        let len = end.saturating_sub(wal_start) as usize;
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(wal_start))?;
        file.read_exact(&mut buf)?;
        Ok(Self::read_region(&buf))
    }

    /// Records targeting one entity, in sequence order. Used by the
    /// recovery manager's scoped replay.
    pub fn records_for(
        result: &WalReadResult,
        id: &entitydb_core::EntityId,
    ) -> Vec<WalRecord> {
        result
            .records
            .iter()
            .filter(|r| &r.entity_id == id)
            .cloned()
            .collect()
    }
}
