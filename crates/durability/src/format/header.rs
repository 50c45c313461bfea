//! Unified file header
//!
//! The header is the first 120 bytes of every `.edb` file and is the single
//! source of truth for section offsets and the entity count. The count is
//! rederived at every checkpoint from the live index — it is never
//! incremented independently, so header and index cannot diverge.
//!
//! # Layout (little-endian)
//!
//! ```text
//! ┌──────────────────────┬───────┬──────────────────────────────────────┐
//! │ Field                │ Bytes │ Notes                                │
//! ├──────────────────────┼───────┼──────────────────────────────────────┤
//! │ magic                │   8   │ "EUFFDB01"                           │
//! │ format_version       │   4   │ gates migration; mismatch is fatal   │
//! │ flags                │   4   │ reserved, zero                       │
//! │ file_size            │   8   │ bytes at last checkpoint             │
//! │ wal_offset, wal_len  │  16   │ WAL section (grows past wal_len)     │
//! │ data_offset, len     │  16   │ entity records                       │
//! │ index_offset, len    │  16   │ tag-index snapshot for warm start    │
//! │ entity_count         │   8   │ == len(index) at last checkpoint     │
//! │ last_checkpoint      │   8   │ nanoseconds since epoch              │
//! │ checksum             │  32   │ full SHA-256 of the 88 bytes above   │
//! └──────────────────────┴───────┴──────────────────────────────────────┘
//! ```

use crate::checksum::sha256_full;
use entitydb_core::Timestamp;

/// Magic bytes identifying an EntityDB unified file.
pub const EUFF_MAGIC: [u8; 8] = *b"EUFFDB01";

/// Current on-disk format version.
pub const EUFF_FORMAT_VERSION: u32 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 120;

const CHECKSUMMED_LEN: usize = 88;

/// Parsed unified file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version found in the file.
    pub format_version: u32,
    /// Reserved flag bits.
    pub flags: u32,
    /// Total file size at the last checkpoint.
    pub file_size: u64,
    /// Absolute offset of the WAL section.
    pub wal_offset: u64,
    /// WAL section length at the last checkpoint (appends grow past it).
    pub wal_length: u64,
    /// Absolute offset of the data section.
    pub data_offset: u64,
    /// Data section length.
    pub data_length: u64,
    /// Absolute offset of the index section.
    pub index_offset: u64,
    /// Index section length.
    pub index_length: u64,
    /// Live entity count, rederived from the index at checkpoint.
    pub entity_count: u64,
    /// Timestamp of the last checkpoint.
    pub last_checkpoint: Timestamp,
}

/// Header parse/validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// Fewer than `HEADER_SIZE` bytes available.
    #[error("file too small for header")]
    TooSmall,

    /// Magic bytes do not identify a unified file.
    #[error("bad magic bytes; not an EntityDB unified file")]
    BadMagic,

    /// Header checksum mismatch.
    #[error("header checksum mismatch")]
    ChecksumMismatch,

    /// On-disk format version this build cannot open.
    #[error("unsupported format version {found}, expected {expected}")]
    UnsupportedVersion {
        /// Version found in the file.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },
}

impl FileHeader {
    /// A header for a freshly created empty file: empty data, index, and
    /// WAL sections packed immediately after the header.
    pub fn new_empty() -> Self {
        let start = HEADER_SIZE as u64;
        FileHeader {
            format_version: EUFF_FORMAT_VERSION,
            flags: 0,
            file_size: start,
            data_offset: start,
            data_length: 0,
            index_offset: start,
            index_length: 0,
            wal_offset: start,
            wal_length: 0,
            entity_count: 0,
            last_checkpoint: Timestamp::ZERO,
        }
    }

    /// Serialize, computing the trailing checksum.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&EUFF_MAGIC);
        bytes[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.flags.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.file_size.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.wal_offset.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.wal_length.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.data_offset.to_le_bytes());
        bytes[48..56].copy_from_slice(&self.data_length.to_le_bytes());
        bytes[56..64].copy_from_slice(&self.index_offset.to_le_bytes());
        bytes[64..72].copy_from_slice(&self.index_length.to_le_bytes());
        bytes[72..80].copy_from_slice(&self.entity_count.to_le_bytes());
        bytes[80..88].copy_from_slice(&self.last_checkpoint.as_nanos().to_le_bytes());
        let digest = sha256_full(&bytes[0..CHECKSUMMED_LEN]);
        bytes[88..120].copy_from_slice(&digest);
        bytes
    }

    /// Parse and validate a header.
    ///
    /// # Errors
    ///
    /// Magic, checksum, and version failures are all distinct — a version
    /// mismatch on an otherwise intact header must be reported as such so
    /// startup can refuse with a migration message rather than "corrupt".
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < HEADER_SIZE {
            return Err(HeaderError::TooSmall);
        }
        if bytes[0..8] != EUFF_MAGIC {
            return Err(HeaderError::BadMagic);
        }

        let expected = sha256_full(&bytes[0..CHECKSUMMED_LEN]);
        if bytes[88..120] != expected {
            return Err(HeaderError::ChecksumMismatch);
        }

        let format_version = u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes"));
        if format_version != EUFF_FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion {
                found: format_version,
                expected: EUFF_FORMAT_VERSION,
            });
        }

        let u64_at = |at: usize| u64::from_le_bytes(bytes[at..at + 8].try_into().expect("8 bytes"));

        Ok(FileHeader {
            format_version,
            flags: u32::from_le_bytes(bytes[12..16].try_into().expect("4 bytes")),
            file_size: u64_at(16),
            wal_offset: u64_at(24),
            wal_length: u64_at(32),
            data_offset: u64_at(40),
            data_length: u64_at(48),
            index_offset: u64_at(56),
            index_length: u64_at(64),
            entity_count: u64_at(72),
            last_checkpoint: Timestamp::from_nanos(u64_at(80)),
        })
    }
}
