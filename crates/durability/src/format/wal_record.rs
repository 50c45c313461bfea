//! WAL record format
//!
//! Every mutation is logged to the WAL section before any in-memory state
//! changes. Records are self-delimiting: the payload length appears before
//! the payload, so replay can skip a checksum-failed record and resume at
//! the next one.
//!
//! # Layout (little-endian)
//!
//! ```text
//! ┌────────────────┬───────┬─────────────────────────────────────────┐
//! │ Field          │ Bytes │ Notes                                   │
//! ├────────────────┼───────┼─────────────────────────────────────────┤
//! │ seq            │   8   │ globally monotonic, assigned at append  │
//! │ op             │   1   │ 1=Create 2=Update 3=Delete 4=AddTag     │
//! │ timestamp      │   8   │ operation wall-clock time               │
//! │ entity_id      │  32   │                                         │
//! │ payload_length │   8   │                                         │
//! │ payload        │  var  │ bincode-encoded `WalPayload`            │
//! │ checksum       │   8   │ truncated SHA-256 of all the above      │
//! └────────────────┴───────┴─────────────────────────────────────────┘
//! ```

use crate::checksum::sha256_trunc8;
use entitydb_core::{Content, EntityId, TemporalTag, Timestamp};
use serde::{Deserialize, Serialize};

/// Fixed prefix before the payload.
pub const WAL_FIXED_LEN: usize = 8 + 1 + 8 + 32 + 8;

/// Trailing checksum length.
pub const WAL_CHECKSUM_LEN: usize = 8;

/// Operation discriminant.
///
/// These values are part of the on-disk format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalOp {
    /// Entity creation.
    Create = 0x01,
    /// Full-entity replacement.
    Update = 0x02,
    /// Tombstone.
    Delete = 0x03,
    /// Single tag append.
    AddTag = 0x04,
}

impl WalOp {
    /// Decode an op byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(WalOp::Create),
            0x02 => Some(WalOp::Update),
            0x03 => Some(WalOp::Delete),
            0x04 => Some(WalOp::AddTag),
            _ => None,
        }
    }
}

/// Operation payload, bincode-encoded into the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalPayload {
    /// Full initial state of a created entity.
    Create {
        /// Initial tag timeline.
        tags: Vec<TemporalTag>,
        /// Initial content.
        content: Content,
    },
    /// Full replacement state.
    Update {
        /// Replacement tag timeline.
        tags: Vec<TemporalTag>,
        /// Replacement content.
        content: Content,
    },
    /// One appended tag.
    AddTag {
        /// The appended tag.
        tag: TemporalTag,
    },
    /// Deletion carries no payload.
    Delete,
}

impl WalPayload {
    /// The op discriminant this payload belongs with.
    pub fn op(&self) -> WalOp {
        match self {
            WalPayload::Create { .. } => WalOp::Create,
            WalPayload::Update { .. } => WalOp::Update,
            WalPayload::AddTag { .. } => WalOp::AddTag,
            WalPayload::Delete => WalOp::Delete,
        }
    }
}

/// A decoded WAL record.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    /// Globally monotonic sequence number.
    pub seq: u64,
    /// Operation kind.
    pub op: WalOp,
    /// Operation wall-clock time.
    pub timestamp: Timestamp,
    /// Target entity.
    pub entity_id: EntityId,
    /// Operation payload.
    pub payload: WalPayload,
}

/// WAL record parse failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalRecordError {
    /// Not enough bytes for a whole record — the tail of the log.
    #[error("insufficient data for a WAL record")]
    InsufficientData,

    /// Checksum failed; the record's claimed length is still usable for
    /// skipping.
    #[error("WAL record checksum mismatch (record length {record_len})")]
    ChecksumMismatch {
        /// Total length of the bad record, for skipping.
        record_len: u64,
    },

    /// Record structure is invalid beyond recovery (bad op byte, bad id,
    /// undecodable payload).
    #[error("malformed WAL record: {0}")]
    Malformed(String),
}

impl WalRecord {
    /// Create a record; the sequence number is assigned by the writer.
    pub fn new(seq: u64, timestamp: Timestamp, entity_id: EntityId, payload: WalPayload) -> Self {
        WalRecord {
            seq,
            op: payload.op(),
            timestamp,
            entity_id,
            payload,
        }
    }

    /// Serialize to record bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = bincode::serialize(&self.payload).expect("WAL payload serialization");
        let mut out = Vec::with_capacity(WAL_FIXED_LEN + payload.len() + WAL_CHECKSUM_LEN);
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.push(self.op as u8);
        out.extend_from_slice(&self.timestamp.as_nanos().to_le_bytes());
        out.extend_from_slice(self.entity_id.as_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&payload);
        let checksum = sha256_trunc8(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Parse one record from the front of `buf`.
    ///
    /// Returns the record and the bytes consumed. Legacy `user_` entity
    /// ids are migrated in place, matching the data-section loader.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, u64), WalRecordError> {
        if buf.len() < WAL_FIXED_LEN {
            return Err(WalRecordError::InsufficientData);
        }
        let payload_len = u64::from_le_bytes(buf[49..57].try_into().expect("8 bytes")) as usize;
        let total = WAL_FIXED_LEN + payload_len + WAL_CHECKSUM_LEN;
        if buf.len() < total {
            return Err(WalRecordError::InsufficientData);
        }

        let body = &buf[..total - WAL_CHECKSUM_LEN];
        let stored = u64::from_le_bytes(
            buf[total - WAL_CHECKSUM_LEN..total]
                .try_into()
                .expect("8 bytes"),
        );
        if sha256_trunc8(body) != stored {
            return Err(WalRecordError::ChecksumMismatch {
                record_len: total as u64,
            });
        }

        let seq = u64::from_le_bytes(body[0..8].try_into().expect("8 bytes"));
        let op = WalOp::from_byte(body[8])
            .ok_or_else(|| WalRecordError::Malformed(format!("unknown op byte {:#04x}", body[8])))?;
        let timestamp = Timestamp::from_nanos(u64::from_le_bytes(
            body[9..17].try_into().expect("8 bytes"),
        ));
        let id_bytes: [u8; 32] = body[17..49].try_into().expect("32 bytes");
        let (entity_id, _migrated) = EntityId::from_record_bytes_migrating(id_bytes)
            .map_err(|e| WalRecordError::Malformed(e.to_string()))?;

        let payload: WalPayload = bincode::deserialize(&body[WAL_FIXED_LEN..])
            .map_err(|e| WalRecordError::Malformed(format!("payload: {}", e)))?;
        if payload.op() != op {
            return Err(WalRecordError::Malformed(
                "op byte disagrees with payload variant".to_string(),
            ));
        }

        Ok((
            WalRecord {
                seq,
                op,
                timestamp,
                entity_id,
                payload,
            },
            total as u64,
        ))
    }
}
