//! Entity identifiers
//!
//! Every entity is named by a fixed 32-character alphanumeric identifier.
//! Historically these were UUID hex strings; short tokens are also valid as
//! long as they are padded to 32 characters by the caller.
//!
//! The character class of an id matters operationally: lookups for missing
//! 32-character pure-hex ids are treated as transient metric artifacts and
//! skipped by the recovery manager, while mixed-alphanumeric ids are treated
//! as real identifiers worth recovering.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Length of an entity identifier in bytes.
pub const ENTITY_ID_LEN: usize = 32;

/// Legacy identifier prefix rewritten on ingest of old files.
pub const LEGACY_USER_PREFIX: &str = "user_";

/// Reserved identifier of the system user entity.
///
/// The recovery manager always attempts recovery for this id, and it is the
/// only id eligible for placeholder synthesis.
pub const SYSTEM_USER_ID: &str = "00000000000000000000000000000001";

/// A 32-character alphanumeric entity identifier.
///
/// Identifiers are immutable and globally unique. Stored on disk as raw
/// ASCII bytes with no length prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId([u8; ENTITY_ID_LEN]);

impl EntityId {
    /// Parse and validate an identifier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the string is not exactly 32 ASCII
    /// alphanumeric characters. Legacy `user_`-prefixed ids are rejected
    /// here; the unified-file loader strips the prefix before parsing.
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with(LEGACY_USER_PREFIX) {
            return Err(Error::invalid_input(format!(
                "legacy '{}' id prefix is not accepted for new writes",
                LEGACY_USER_PREFIX
            )));
        }
        if s.len() != ENTITY_ID_LEN {
            return Err(Error::invalid_input(format!(
                "entity id must be {} characters, got {}",
                ENTITY_ID_LEN,
                s.len()
            )));
        }
        if !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::invalid_input(
                "entity id must be ASCII alphanumeric".to_string(),
            ));
        }
        let mut bytes = [0u8; ENTITY_ID_LEN];
        bytes.copy_from_slice(s.as_bytes());
        Ok(EntityId(bytes))
    }

    /// Generate a fresh identifier from a UUID v4 (32 hex characters).
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        let mut bytes = [0u8; ENTITY_ID_LEN];
        bytes.copy_from_slice(hex.as_bytes());
        EntityId(bytes)
    }

    /// The reserved system user id.
    pub fn system_user() -> Self {
        let mut bytes = [0u8; ENTITY_ID_LEN];
        bytes.copy_from_slice(SYSTEM_USER_ID.as_bytes());
        EntityId(bytes)
    }

    /// Reconstruct an id from raw record bytes.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityViolation` if the bytes are not valid ASCII
    /// alphanumerics — a record carrying such an id is corrupt.
    pub fn from_record_bytes(bytes: [u8; ENTITY_ID_LEN]) -> Result<Self> {
        if !bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::IntegrityViolation(
                "entity id bytes are not ASCII alphanumeric".to_string(),
            ));
        }
        Ok(EntityId(bytes))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        // Validated ASCII at construction
        std::str::from_utf8(&self.0).expect("entity id is always ASCII")
    }

    /// The id as raw bytes, exactly as stored on disk.
    pub fn as_bytes(&self) -> &[u8; ENTITY_ID_LEN] {
        &self.0
    }

    /// True when every character is a hex digit.
    ///
    /// Missing pure-hex ids are classified as metric artifacts and skipped
    /// by recovery.
    pub fn is_pure_hex(&self) -> bool {
        self.0.iter().all(|b| b.is_ascii_hexdigit())
    }

    /// True for the reserved system user id.
    pub fn is_system_user(&self) -> bool {
        self.as_str() == SYSTEM_USER_ID
    }

    /// Rewrite a legacy `user_`-prefixed id found in an old file.
    ///
    /// Legacy ids occupy the same 32-byte record field: `user_` followed by
    /// 27 alphanumerics. The migration strips the prefix and left-pads the
    /// remainder with zeros back to 32 characters. Used only by the file
    /// loader and WAL replay; the write path rejects prefixed ids outright.
    pub fn migrate_legacy(s: &str) -> Option<EntityId> {
        let bare = s.strip_prefix(LEGACY_USER_PREFIX)?;
        if s.len() == ENTITY_ID_LEN && bare.bytes().all(|b| b.is_ascii_alphanumeric()) {
            let mut bytes = [b'0'; ENTITY_ID_LEN];
            bytes[ENTITY_ID_LEN - bare.len()..].copy_from_slice(bare.as_bytes());
            Some(EntityId(bytes))
        } else {
            None
        }
    }

    /// Decode a 32-byte record id field, rewriting legacy `user_` ids.
    ///
    /// Returns the id and whether a migration happened, so the loader can
    /// log rewrites.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityViolation` when the bytes are neither a valid id
    /// nor a migratable legacy id.
    pub fn from_record_bytes_migrating(bytes: [u8; ENTITY_ID_LEN]) -> Result<(Self, bool)> {
        if let Ok(id) = EntityId::from_record_bytes(bytes) {
            return Ok((id, false));
        }
        let s = std::str::from_utf8(&bytes).map_err(|_| {
            Error::IntegrityViolation("entity id bytes are not UTF-8".to_string())
        })?;
        match EntityId::migrate_legacy(s) {
            Some(id) => Ok((id, true)),
            None => Err(Error::IntegrityViolation(
                "entity id bytes are not a valid or migratable id".to_string(),
            )),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.as_str())
    }
}

impl std::str::FromStr for EntityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EntityId::parse(s)
    }
}
