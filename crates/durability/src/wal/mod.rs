//! Write-ahead log over the unified file's WAL section
//!
//! - `policy`: fsync policy (per-operation, every-N, periodic)
//! - `writer`: appender with monotonic sequence numbers and rollback on
//!   failed appends
//! - `reader`: deterministic replay with checksum skip and tail truncation
//!
//! # Key invariants
//!
//! - The WAL is append-only; records are never modified in place
//! - Every record is self-delimiting (length before payload, checksum after)
//! - A successful append is durable to the configured fsync policy before
//!   any in-memory state changes
//! - Sequence numbers are globally monotonic across restarts

pub mod policy;
pub mod reader;
pub mod writer;

pub use policy::FsyncPolicy;
pub use reader::{WalReadResult, WalReader};
pub use writer::WalWriter;
