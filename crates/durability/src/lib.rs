//! Durability layer for EntityDB
//!
//! This crate handles everything that touches disk:
//!
//! - the unified `.edb` file: header, data section, index section, WAL tail
//! - binary on-disk formats (entity records, WAL records, index snapshot)
//! - WAL writer with fsync policies, WAL reader with damage-tolerant replay
//! - shadow-file checkpointing with atomic rename swap
//! - memory-mapped read path
//! - pattern-based selective recovery
//!
//! Record checksums are SHA-256 truncated to 8 bytes; the file header
//! carries the full digest.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod checksum;
pub mod format;
pub mod reader;
pub mod recovery;
pub mod unified;
pub mod wal;

pub use checkpoint::{write_checkpoint, CheckpointOutcome, CheckpointTriggers};
pub use checksum::{sha256_full, sha256_trunc8};
pub use format::{
    decode_index, decode_record, encode_index, encode_record, frame_at, FileHeader, HeaderError,
    IndexSnapshot, RecordFrame, WalOp, WalPayload, WalRecord, WalRecordError,
    EUFF_FORMAT_VERSION, EUFF_MAGIC, HEADER_SIZE,
};
pub use reader::MappedReader;
pub use recovery::{
    RecoveryCounters, RecoveryDecision, RecoveryManager, RecoveryPolicyMode, RecoverySource,
};
pub use unified::{UnifiedFile, EDB_EXTENSION};
pub use wal::{FsyncPolicy, WalReadResult, WalReader, WalWriter};
