//! Entity content variants
//!
//! Content is an opaque byte payload stored in one of four shapes. The
//! writer picks the shape from the payload size; the reader dispatches on
//! the variant tag carried in the entity record's flags word.
//!
//! - `Empty`: no payload
//! - `Inline`: raw bytes, stored in the record
//! - `Compressed`: zstd-compressed bytes above the compression threshold
//! - `Chunked`: payload split across chunk entities above the chunk threshold

use crate::error::{Error, Result};
use crate::id::EntityId;
use serde::{Deserialize, Serialize};

/// Variant tag values stored in the record flags word.
///
/// These are part of the on-disk format and must not change.
pub const CONTENT_KIND_EMPTY: u8 = 0x00;
/// Inline variant tag.
pub const CONTENT_KIND_INLINE: u8 = 0x01;
/// Compressed variant tag.
pub const CONTENT_KIND_COMPRESSED: u8 = 0x02;
/// Chunked variant tag.
pub const CONTENT_KIND_CHUNKED: u8 = 0x03;

/// Opaque entity payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Content {
    /// No payload.
    #[default]
    Empty,
    /// Raw bytes stored inline in the entity record.
    Inline(Vec<u8>),
    /// zstd-compressed payload; `raw_len` is the uncompressed size.
    Compressed {
        /// Uncompressed payload length.
        raw_len: u64,
        /// Compressed bytes.
        data: Vec<u8>,
    },
    /// Payload split across chunk entities, in order.
    Chunked(Vec<EntityId>),
}

impl Content {
    /// The flags-word variant tag for this content.
    pub fn kind(&self) -> u8 {
        match self {
            Content::Empty => CONTENT_KIND_EMPTY,
            Content::Inline(_) => CONTENT_KIND_INLINE,
            Content::Compressed { .. } => CONTENT_KIND_COMPRESSED,
            Content::Chunked(_) => CONTENT_KIND_CHUNKED,
        }
    }

    /// True when there is no payload at all.
    pub fn is_empty(&self) -> bool {
        matches!(self, Content::Empty)
    }

    /// Bytes this content occupies in the record's content section.
    pub fn stored_len(&self) -> usize {
        match self {
            Content::Empty => 0,
            Content::Inline(data) => data.len(),
            Content::Compressed { data, .. } => 8 + data.len(),
            Content::Chunked(chunks) => chunks.len() * crate::id::ENTITY_ID_LEN,
        }
    }

    /// Logical (uncompressed, unchunked) payload length when known.
    ///
    /// For chunked content the logical length lives in the chunk entities,
    /// so `None` is returned.
    pub fn logical_len(&self) -> Option<u64> {
        match self {
            Content::Empty => Some(0),
            Content::Inline(data) => Some(data.len() as u64),
            Content::Compressed { raw_len, .. } => Some(*raw_len),
            Content::Chunked(_) => None,
        }
    }

    /// Approximate heap footprint, used for cache byte accounting.
    pub fn heap_size(&self) -> usize {
        match self {
            Content::Empty => 0,
            Content::Inline(data) => data.capacity(),
            Content::Compressed { data, .. } => data.capacity(),
            Content::Chunked(chunks) => chunks.capacity() * crate::id::ENTITY_ID_LEN,
        }
    }

    /// Serialize the content section of an entity record.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Content::Empty => Vec::new(),
            Content::Inline(data) => data.clone(),
            Content::Compressed { raw_len, data } => {
                let mut out = Vec::with_capacity(8 + data.len());
                out.extend_from_slice(&raw_len.to_le_bytes());
                out.extend_from_slice(data);
                out
            }
            Content::Chunked(chunks) => {
                let mut out = Vec::with_capacity(chunks.len() * crate::id::ENTITY_ID_LEN);
                for chunk in chunks {
                    out.extend_from_slice(chunk.as_bytes());
                }
                out
            }
        }
    }

    /// Decode the content section given the flags-word variant tag.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityViolation` for an unknown variant tag or a section
    /// whose length does not match the variant's framing.
    pub fn decode(kind: u8, bytes: &[u8]) -> Result<Self> {
        match kind {
            CONTENT_KIND_EMPTY => {
                if !bytes.is_empty() {
                    return Err(Error::IntegrityViolation(
                        "empty content variant with a non-empty section".to_string(),
                    ));
                }
                Ok(Content::Empty)
            }
            CONTENT_KIND_INLINE => Ok(Content::Inline(bytes.to_vec())),
            CONTENT_KIND_COMPRESSED => {
                if bytes.len() < 8 {
                    return Err(Error::IntegrityViolation(
                        "compressed content section shorter than its length field".to_string(),
                    ));
                }
                let raw_len = u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes"));
                Ok(Content::Compressed {
                    raw_len,
                    data: bytes[8..].to_vec(),
                })
            }
            CONTENT_KIND_CHUNKED => {
                if bytes.len() % crate::id::ENTITY_ID_LEN != 0 {
                    return Err(Error::IntegrityViolation(
                        "chunked content section is not a whole number of chunk ids".to_string(),
                    ));
                }
                let mut chunks = Vec::with_capacity(bytes.len() / crate::id::ENTITY_ID_LEN);
                for raw in bytes.chunks_exact(crate::id::ENTITY_ID_LEN) {
                    let arr: [u8; crate::id::ENTITY_ID_LEN] =
                        raw.try_into().expect("chunk id length");
                    chunks.push(EntityId::from_record_bytes(arr)?);
                }
                Ok(Content::Chunked(chunks))
            }
            other => Err(Error::IntegrityViolation(format!(
                "unknown content variant tag {:#04x}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_round_trip() {
        let c = Content::Empty;
        let bytes = c.encode();
        assert!(bytes.is_empty());
        assert_eq!(Content::decode(c.kind(), &bytes).unwrap(), c);
    }

    #[test]
    fn inline_round_trip() {
        let c = Content::Inline(b"hello world".to_vec());
        let decoded = Content::decode(c.kind(), &c.encode()).unwrap();
        assert_eq!(decoded, c);
        assert_eq!(decoded.logical_len(), Some(11));
    }

    #[test]
    fn compressed_round_trip() {
        let c = Content::Compressed {
            raw_len: 4096,
            data: vec![1, 2, 3, 4],
        };
        let decoded = Content::decode(c.kind(), &c.encode()).unwrap();
        assert_eq!(decoded, c);
        assert_eq!(decoded.logical_len(), Some(4096));
    }

    #[test]
    fn chunked_round_trip() {
        let chunks = vec![EntityId::generate(), EntityId::generate()];
        let c = Content::Chunked(chunks.clone());
        let decoded = Content::decode(c.kind(), &c.encode()).unwrap();
        assert_eq!(decoded, Content::Chunked(chunks));
        assert_eq!(decoded.logical_len(), None);
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        assert!(Content::decode(0x7F, &[]).is_err());
    }

    #[test]
    fn decode_rejects_misframed_sections() {
        assert!(Content::decode(CONTENT_KIND_EMPTY, b"junk").is_err());
        assert!(Content::decode(CONTENT_KIND_COMPRESSED, &[1, 2, 3]).is_err());
        assert!(Content::decode(CONTENT_KIND_CHUNKED, &[0u8; 33]).is_err());
    }
}
