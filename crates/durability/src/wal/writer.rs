//! WAL writer
//!
//! Appends operation records to the WAL section at the tail of the unified
//! file. Appending is the first step of every durable mutation: only after
//! the record is written (and synced, per policy) may the caller touch
//! in-memory state.
//!
//! A failed append leaves the WAL exactly as it was — the partial record is
//! truncated away and the sequence number is not consumed. If even the
//! truncation fails the writer poisons itself; every later append reports
//! a transient error until a checkpoint installs a fresh file handle.

use crate::format::wal_record::{WalPayload, WalRecord};
use crate::wal::policy::FsyncPolicy;
use entitydb_core::{EntityId, Error, Result, Timestamp};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::time::Instant;
use tracing::{error, warn};

struct WalInner {
    file: File,
    /// Absolute offset where the WAL section begins.
    wal_start: u64,
    /// Absolute offset of the next append (current end of file).
    end: u64,
    next_seq: u64,
    ops_since_sync: u32,
    last_sync: Instant,
    /// Operations appended since the last checkpoint.
    ops_since_checkpoint: u64,
    poisoned: bool,
}

/// Appender over the unified file's WAL section.
pub struct WalWriter {
    inner: Mutex<WalInner>,
    policy: FsyncPolicy,
}

impl WalWriter {
    /// Create a writer positioned at the current end of the WAL region.
    ///
    /// `next_seq` continues the sequence from replayed records so sequence
    /// numbers stay globally monotonic across restarts.
    pub fn new(file: File, wal_start: u64, wal_end: u64, next_seq: u64, policy: FsyncPolicy) -> Self {
        WalWriter {
            inner: Mutex::new(WalInner {
                file,
                wal_start,
                end: wal_end,
                next_seq,
                ops_since_sync: 0,
                last_sync: Instant::now(),
                ops_since_checkpoint: 0,
                poisoned: false,
            }),
            policy,
        }
    }

    /// Append one operation, returning its sequence number.
    ///
    /// On success the operation is durable to the configured policy. On
    /// failure nothing is consumed: no sequence number, no WAL bytes, and
    /// the caller must not mutate in-memory state.
    pub fn append(
        &self,
        timestamp: Timestamp,
        entity_id: EntityId,
        payload: WalPayload,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(Error::Transient(
                "WAL writer poisoned by an earlier failed append".to_string(),
            ));
        }

        let seq = inner.next_seq;
        let record = WalRecord::new(seq, timestamp, entity_id, payload);
        let bytes = record.to_bytes();
        let prev_end = inner.end;

        let write_result = inner
            .file
            .seek(SeekFrom::Start(prev_end))
            .and_then(|_| inner.file.write_all(&bytes));
        if let Err(e) = write_result {
            Self::rollback(&mut inner, prev_end);
            return Err(e.into());
        }
        inner.end = prev_end + bytes.len() as u64;
        inner.ops_since_sync += 1;

        let elapsed = inner.last_sync.elapsed();
        if self.policy.should_sync(inner.ops_since_sync, elapsed) {
            if let Err(e) = inner.file.sync_data() {
                // The operation must not report durable success; undo it
                Self::rollback(&mut inner, prev_end);
                return Err(e.into());
            }
            inner.ops_since_sync = 0;
            inner.last_sync = Instant::now();
        }

        inner.next_seq = seq + 1;
        inner.ops_since_checkpoint += 1;
        Ok(seq)
    }

    fn rollback(inner: &mut WalInner, prev_end: u64) {
        if let Err(e) = inner.file.set_len(prev_end) {
            error!(error = %e, "failed to truncate WAL after failed append; poisoning writer");
            inner.poisoned = true;
        } else {
            warn!("WAL append failed; truncated partial record");
            inner.end = prev_end;
        }
    }

    /// Force an fsync regardless of policy.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_data()?;
        inner.ops_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    /// Operations appended since the last checkpoint.
    pub fn ops_since_checkpoint(&self) -> u64 {
        self.inner.lock().ops_since_checkpoint
    }

    /// Bytes in the WAL region.
    pub fn bytes(&self) -> u64 {
        let inner = self.inner.lock();
        inner.end - inner.wal_start
    }

    /// The next sequence number to be assigned.
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Install a fresh file handle after a checkpoint swapped the file.
    ///
    /// The new file has an empty WAL region starting at `wal_start`;
    /// sequence numbers continue unbroken.
    pub fn reset_after_checkpoint(&self, file: File, wal_start: u64) {
        let mut inner = self.inner.lock();
        inner.file = file;
        inner.wal_start = wal_start;
        inner.end = wal_start;
        inner.ops_since_sync = 0;
        inner.ops_since_checkpoint = 0;
        inner.last_sync = Instant::now();
        inner.poisoned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::reader::WalReader;
    use entitydb_core::{Content, TemporalTag};
    use std::io::Read;
    use tempfile::tempdir;

    fn payload() -> WalPayload {
        WalPayload::Create {
            tags: vec![TemporalTag::new(Timestamp::from_nanos(1), "type", "task")],
            content: Content::Empty,
        }
    }

    fn temp_wal() -> (tempfile::TempDir, WalWriter) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.edb");
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let writer = WalWriter::new(file, 0, 0, 1, FsyncPolicy::PerOperation);
        (dir, writer)
    }

    #[test]
    fn append_assigns_monotonic_seqs() {
        let (_dir, writer) = temp_wal();
        let id = EntityId::generate();
        for expected in 1..=5u64 {
            let seq = writer.append(Timestamp::now(), id, payload()).unwrap();
            assert_eq!(seq, expected);
        }
        assert_eq!(writer.next_seq(), 6);
        assert_eq!(writer.ops_since_checkpoint(), 5);
    }

    #[test]
    fn appended_records_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.edb");
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let writer = WalWriter::new(file, 0, 0, 1, FsyncPolicy::PerOperation);

        let id = EntityId::generate();
        writer.append(Timestamp::from_nanos(10), id, payload()).unwrap();
        writer
            .append(
                Timestamp::from_nanos(20),
                id,
                WalPayload::AddTag {
                    tag: TemporalTag::new(Timestamp::from_nanos(20), "status", "open"),
                },
            )
            .unwrap();

        let mut buf = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut buf).unwrap();
        let result = WalReader::read_region(&buf);
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.skipped, 0);
        assert_eq!(result.records[0].seq, 1);
        assert_eq!(result.records[1].seq, 2);
    }

    #[test]
    fn reset_continues_sequence() {
        let (dir, writer) = temp_wal();
        let id = EntityId::generate();
        writer.append(Timestamp::now(), id, payload()).unwrap();
        writer.append(Timestamp::now(), id, payload()).unwrap();

        let fresh = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.path().join("wal2.edb"))
            .unwrap();
        writer.reset_after_checkpoint(fresh, 0);

        assert_eq!(writer.ops_since_checkpoint(), 0);
        assert_eq!(writer.bytes(), 0);
        let seq = writer.append(Timestamp::now(), id, payload()).unwrap();
        assert_eq!(seq, 3);
    }

    #[test]
    fn bytes_track_region_growth() {
        let (_dir, writer) = temp_wal();
        assert_eq!(writer.bytes(), 0);
        writer
            .append(Timestamp::now(), EntityId::generate(), payload())
            .unwrap();
        assert!(writer.bytes() > 0);
    }
}
