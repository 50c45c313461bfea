//! Error types for EntityDB
//!
//! One unified error type covers every public API. Callers discriminate by
//! kind, never by downcasting. Errors carry entity-id context where one is
//! known; internal file offsets and stack detail never leak into messages.
//!
//! ### Error kinds
//!
//! - **NotFound / AlreadyExists**: existence failures
//! - **InvalidInput**: missing mandatory tag, malformed timestamp, out-of-order tag
//! - **IntegrityViolation**: checksum mismatch, format version mismatch
//! - **ResourceExhausted**: disk full, memory limit
//! - **Conflict**: concurrent-write contention exhausted retries
//! - **Corrupted**: unreadable record after recovery attempts
//! - **Transient**: retryable I/O failure
//!
//! ### Usage
//!
//! ```ignore
//! match repo.get(&id) {
//!     Err(Error::NotFound { id }) => println!("no such entity: {}", id),
//!     Err(e) if e.is_retryable() => { /* retry */ }
//!     Err(e) => return Err(e),
//!     Ok(entity) => { /* ... */ }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Result type alias for EntityDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the EntityDB engine
#[derive(Debug, Error)]
pub enum Error {
    /// Entity does not exist
    #[error("entity not found: {id}")]
    NotFound {
        /// The entity id that was looked up
        id: String,
    },

    /// Entity already exists (create on an existing id)
    #[error("entity already exists: {id}")]
    AlreadyExists {
        /// The entity id that collided
        id: String,
    },

    /// Invalid input: missing mandatory tag, malformed timestamp,
    /// out-of-order tag, bad identifier
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Integrity violation: checksum mismatch, format version mismatch
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// Resource exhausted: disk full, memory limit reached
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Concurrent-write contention exhausted retries
    #[error("write conflict on {id}: {reason}")]
    Conflict {
        /// The contended entity id
        id: String,
        /// What the writer was attempting
        reason: String,
    },

    /// Record unreadable after recovery attempts
    #[error("corrupted record for {id}: {detail}")]
    Corrupted {
        /// The entity id whose record is unreadable
        id: String,
        /// Short description of the corruption
        detail: String,
    },

    /// Retryable I/O failure
    #[error("transient I/O error: {0}")]
    Transient(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::OutOfMemory => Error::ResourceExhausted(e.to_string()),
            // ENOSPC surfaces as Other on stable; recognize it by OS code
            _ if e.raw_os_error() == Some(28) => Error::ResourceExhausted(e.to_string()),
            _ => Error::Transient(e.to_string()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::IntegrityViolation(format!("serialization: {}", e))
    }
}

impl Error {
    /// Shorthand for `Error::NotFound`.
    pub fn not_found(id: impl Into<String>) -> Self {
        Error::NotFound { id: id.into() }
    }

    /// Shorthand for `Error::AlreadyExists`.
    pub fn already_exists(id: impl Into<String>) -> Self {
        Error::AlreadyExists { id: id.into() }
    }

    /// Shorthand for `Error::InvalidInput`.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Shorthand for `Error::Corrupted`.
    pub fn corrupted(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Corrupted {
            id: id.into(),
            detail: detail.into(),
        }
    }

    /// True for errors a caller may retry (transient I/O).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// True when the error means the entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for write-contention failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}
