//! Index section format
//!
//! The index section is a snapshot of the sharded tag index, written at
//! checkpoint and used only for warm starts. It is never the source of
//! truth: a corrupt or missing section just means the index is rebuilt
//! from the data section.
//!
//! # Layout (little-endian)
//!
//! ```text
//! shard_count (4)
//! per shard:
//!   tag_count (4)
//!   per tag:
//!     tag_length (2)
//!     tag bytes
//!     entity_count (4)
//!     entity ids (32 each)
//! ```

use entitydb_core::{EntityId, Error, Result, ENTITY_ID_LEN};

/// Serialized shard snapshot: tag → sorted entity ids.
pub type IndexSnapshot = Vec<Vec<(String, Vec<EntityId>)>>;

/// Serialize an index snapshot into section bytes.
pub fn encode_index(snapshot: &IndexSnapshot) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(snapshot.len() as u32).to_le_bytes());
    for shard in snapshot {
        out.extend_from_slice(&(shard.len() as u32).to_le_bytes());
        for (tag, ids) in shard {
            out.extend_from_slice(&(tag.len() as u16).to_le_bytes());
            out.extend_from_slice(tag.as_bytes());
            out.extend_from_slice(&(ids.len() as u32).to_le_bytes());
            for id in ids {
                out.extend_from_slice(id.as_bytes());
            }
        }
    }
    out
}

/// Parse an index section back into a snapshot.
///
/// # Errors
///
/// Any framing violation is an `IntegrityViolation`; the caller falls back
/// to a rebuild from the data section.
pub fn decode_index(buf: &[u8]) -> Result<IndexSnapshot> {
    let mut cursor = Cursor { buf, pos: 0 };
    let shard_count = cursor.read_u32()? as usize;
    let mut snapshot = Vec::with_capacity(shard_count);
    for _ in 0..shard_count {
        let tag_count = cursor.read_u32()? as usize;
        let mut shard = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            let tag_len = cursor.read_u16()? as usize;
            let tag_bytes = cursor.read_bytes(tag_len)?;
            let tag = std::str::from_utf8(tag_bytes)
                .map_err(|_| {
                    Error::IntegrityViolation("index tag is not UTF-8".to_string())
                })?
                .to_string();
            let entity_count = cursor.read_u32()? as usize;
            let mut ids = Vec::with_capacity(entity_count);
            for _ in 0..entity_count {
                let raw = cursor.read_bytes(ENTITY_ID_LEN)?;
                let arr: [u8; ENTITY_ID_LEN] = raw.try_into().expect("id length");
                ids.push(EntityId::from_record_bytes(arr)?);
            }
            shard.push((tag, ids));
        }
        snapshot.push(shard);
    }
    if cursor.pos != buf.len() {
        return Err(Error::IntegrityViolation(
            "trailing bytes after index section".to_string(),
        ));
    }
    Ok(snapshot)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() < self.pos + len {
            return Err(Error::IntegrityViolation(
                "index section truncated".to_string(),
            ));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().expect("2 bytes")))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_round_trip() {
        let snapshot: IndexSnapshot = vec![Vec::new(); 16];
        let decoded = decode_index(&encode_index(&snapshot)).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn populated_snapshot_round_trip() {
        let a = EntityId::generate();
        let b = EntityId::generate();
        let mut snapshot: IndexSnapshot = vec![Vec::new(); 16];
        snapshot[3].push(("type:task".to_string(), vec![a, b]));
        snapshot[3].push(("status:open".to_string(), vec![a]));
        snapshot[9].push(("dataset:ops".to_string(), vec![b]));

        let decoded = decode_index(&encode_index(&snapshot)).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn truncated_section_is_rejected() {
        let a = EntityId::generate();
        let snapshot: IndexSnapshot = vec![vec![("type:task".to_string(), vec![a])]];
        let bytes = encode_index(&snapshot);
        assert!(decode_index(&bytes[..bytes.len() - 10]).is_err());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let snapshot: IndexSnapshot = vec![Vec::new(); 16];
        let mut bytes = encode_index(&snapshot);
        bytes.extend_from_slice(b"junk");
        assert!(decode_index(&bytes).is_err());
    }
}
