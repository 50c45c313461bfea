//! Record and header checksums
//!
//! Record-level integrity uses SHA-256 truncated to 8 bytes, stored
//! little-endian. The file header carries the full 32-byte digest. Both
//! detect single-bit flips with overwhelming probability; truncation keeps
//! per-record overhead at one word.

use sha2::{Digest, Sha256};

/// Full 32-byte SHA-256 digest.
pub fn sha256_full(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 truncated to its first 8 bytes, as a little-endian `u64`.
pub fn sha256_trunc8(data: &[u8]) -> u64 {
    let digest = sha256_full(data);
    u64::from_le_bytes(digest[0..8].try_into().expect("digest is 32 bytes"))
}

/// Truncated SHA-256 over several concatenated slices, without copying.
pub fn sha256_trunc8_parts(parts: &[&[u8]]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest: [u8; 32] = hasher.finalize().into();
    u64::from_le_bytes(digest[0..8].try_into().expect("digest is 32 bytes"))
}
