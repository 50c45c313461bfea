//! Entity record format
//!
//! The data section is a contiguous sequence of entity records. Each record
//! is self-describing: all lengths appear before the variable sections, so
//! a scan can skip records without decoding tags or content.
//!
//! # Layout (little-endian)
//!
//! ```text
//! ┌────────────────────┬───────┬─────────────────────────────────────┐
//! │ Field              │ Bytes │ Notes                               │
//! ├────────────────────┼───────┼─────────────────────────────────────┤
//! │ id                 │  32   │ ASCII alphanumeric                  │
//! │ flags              │   4   │ low byte = content variant tag      │
//! │ created_at         │   8   │ earliest tag timestamp              │
//! │ updated_at         │   8   │ latest tag timestamp                │
//! │ tag_count          │   4   │                                     │
//! │ tag_section_length │   8   │ bytes of tags[]                     │
//! │ content_length     │   8   │ bytes of content[]                  │
//! │ tags[]             │  var  │ per tag: ts(8) ns_len(2) ns         │
//! │                    │       │          val_len(4) val             │
//! │ content[]          │  var  │ framing per content variant         │
//! │ record_checksum    │   8   │ truncated SHA-256 of all the above  │
//! └────────────────────┴───────┴─────────────────────────────────────┘
//! ```

use crate::checksum::sha256_trunc8;
use entitydb_core::{Content, Entity, EntityId, Error, Result, TemporalTag, Timestamp};

/// Fixed prefix before the variable sections.
pub const RECORD_FIXED_LEN: usize = 32 + 4 + 8 + 8 + 4 + 8 + 8;

/// Trailing checksum length.
pub const RECORD_CHECKSUM_LEN: usize = 8;

/// A record scan result: where the record sits and what id it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFrame {
    /// Entity id, already migrated if it was a legacy id.
    pub id: EntityId,
    /// Byte offset of the record within the scanned buffer.
    pub offset: u64,
    /// Total record length including the checksum.
    pub len: u64,
    /// True when the id was rewritten from the legacy `user_` form.
    pub migrated: bool,
}

/// Serialize an entity into record bytes.
pub fn encode_record(entity: &Entity) -> Vec<u8> {
    let mut tag_section = Vec::new();
    for tag in &entity.tags {
        tag_section.extend_from_slice(&tag.timestamp.as_nanos().to_le_bytes());
        tag_section.extend_from_slice(&(tag.namespace.len() as u16).to_le_bytes());
        tag_section.extend_from_slice(tag.namespace.as_bytes());
        tag_section.extend_from_slice(&(tag.value.len() as u32).to_le_bytes());
        tag_section.extend_from_slice(tag.value.as_bytes());
    }
    let content_section = entity.content.encode();

    let total = RECORD_FIXED_LEN + tag_section.len() + content_section.len() + RECORD_CHECKSUM_LEN;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(entity.id.as_bytes());
    out.extend_from_slice(&(entity.content.kind() as u32).to_le_bytes());
    out.extend_from_slice(&entity.created_at.as_nanos().to_le_bytes());
    out.extend_from_slice(&entity.updated_at.as_nanos().to_le_bytes());
    out.extend_from_slice(&(entity.tags.len() as u32).to_le_bytes());
    out.extend_from_slice(&(tag_section.len() as u64).to_le_bytes());
    out.extend_from_slice(&(content_section.len() as u64).to_le_bytes());
    out.extend_from_slice(&tag_section);
    out.extend_from_slice(&content_section);

    let checksum = sha256_trunc8(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

/// Read the frame of the record starting at `offset`, without decoding
/// tags or content.
///
/// # Errors
///
/// Returns `IntegrityViolation` when the buffer cannot hold the lengths the
/// record claims — the caller treats that as a truncated or corrupt data
/// section.
pub fn frame_at(buf: &[u8], offset: u64) -> Result<RecordFrame> {
    let start = offset as usize;
    if buf.len() < start + RECORD_FIXED_LEN {
        return Err(Error::IntegrityViolation(
            "data section truncated inside a record prefix".to_string(),
        ));
    }
    let id_bytes: [u8; 32] = buf[start..start + 32].try_into().expect("32 bytes");
    let (id, migrated) = EntityId::from_record_bytes_migrating(id_bytes)?;

    let tag_section_len =
        u64::from_le_bytes(buf[start + 56..start + 64].try_into().expect("8 bytes"));
    let content_len = u64::from_le_bytes(buf[start + 64..start + 72].try_into().expect("8 bytes"));

    let total = RECORD_FIXED_LEN as u64 + tag_section_len + content_len + RECORD_CHECKSUM_LEN as u64;
    if (buf.len() as u64) < offset + total {
        return Err(Error::IntegrityViolation(
            "data section truncated inside a record body".to_string(),
        ));
    }
    Ok(RecordFrame {
        id,
        offset,
        len: total,
        migrated,
    })
}

/// Decode and checksum-verify the record starting at `offset`.
///
/// The returned entity has its id migrated if the record carried a legacy
/// id; the bytes on disk are rewritten at the next checkpoint.
pub fn decode_record(buf: &[u8], offset: u64) -> Result<Entity> {
    let frame = frame_at(buf, offset)?;
    let start = offset as usize;
    let end = (offset + frame.len) as usize;
    let body = &buf[start..end - RECORD_CHECKSUM_LEN];
    let stored =
        u64::from_le_bytes(buf[end - RECORD_CHECKSUM_LEN..end].try_into().expect("8 bytes"));
    if sha256_trunc8(body) != stored {
        return Err(Error::corrupted(
            frame.id.to_string(),
            "record checksum mismatch",
        ));
    }

    let flags = u32::from_le_bytes(body[32..36].try_into().expect("4 bytes"));
    let created_at = Timestamp::from_nanos(u64::from_le_bytes(
        body[36..44].try_into().expect("8 bytes"),
    ));
    let updated_at = Timestamp::from_nanos(u64::from_le_bytes(
        body[44..52].try_into().expect("8 bytes"),
    ));
    let tag_count = u32::from_le_bytes(body[52..56].try_into().expect("4 bytes")) as usize;
    let tag_section_len =
        u64::from_le_bytes(body[56..64].try_into().expect("8 bytes")) as usize;

    let tags_start = RECORD_FIXED_LEN;
    let tags_end = tags_start + tag_section_len;
    let tags = decode_tags(&frame.id, &body[tags_start..tags_end], tag_count)?;

    let content_kind = (flags & 0xFF) as u8;
    let content = Content::decode(content_kind, &body[tags_end..])?;

    let entity = Entity::new(frame.id, tags, content)?;
    if entity.created_at != created_at || entity.updated_at != updated_at {
        return Err(Error::corrupted(
            frame.id.to_string(),
            "stored timestamps disagree with tag timeline",
        ));
    }
    Ok(entity)
}

fn decode_tags(id: &EntityId, mut buf: &[u8], expected: usize) -> Result<Vec<TemporalTag>> {
    let mut tags = Vec::with_capacity(expected);
    while !buf.is_empty() {
        if buf.len() < 10 {
            return Err(Error::corrupted(id.to_string(), "truncated tag entry"));
        }
        let ts = u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes"));
        let ns_len = u16::from_le_bytes(buf[8..10].try_into().expect("2 bytes")) as usize;
        buf = &buf[10..];
        if buf.len() < ns_len + 4 {
            return Err(Error::corrupted(id.to_string(), "truncated tag namespace"));
        }
        let namespace = std::str::from_utf8(&buf[..ns_len])
            .map_err(|_| Error::corrupted(id.to_string(), "tag namespace is not UTF-8"))?
            .to_string();
        let val_len =
            u32::from_le_bytes(buf[ns_len..ns_len + 4].try_into().expect("4 bytes")) as usize;
        buf = &buf[ns_len + 4..];
        if buf.len() < val_len {
            return Err(Error::corrupted(id.to_string(), "truncated tag value"));
        }
        let value = std::str::from_utf8(&buf[..val_len])
            .map_err(|_| Error::corrupted(id.to_string(), "tag value is not UTF-8"))?
            .to_string();
        buf = &buf[val_len..];
        tags.push(TemporalTag::new(Timestamp::from_nanos(ts), namespace, value));
    }
    if tags.len() != expected {
        return Err(Error::corrupted(
            id.to_string(),
            "tag count disagrees with tag section",
        ));
    }
    Ok(tags)
}
