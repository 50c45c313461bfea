//! The unified database file
//!
//! A single `.edb` file holds everything: header, data section, index
//! section, and the WAL at the tail. This module owns opening, creating,
//! validating, and locking that file; section contents are handled by the
//! `format`, `wal`, `reader`, and `checkpoint` modules.
//!
//! A format-version mismatch is fatal at startup — an old-format file must
//! be migrated offline, and a newer-format file must not be opened for
//! write at all. The file is held under an exclusive advisory lock for the
//! lifetime of the handle, so a second process cannot corrupt it.

use crate::format::header::{FileHeader, HeaderError, HEADER_SIZE};
use entitydb_core::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Conventional extension for unified files.
pub const EDB_EXTENSION: &str = "edb";

/// Open handle on the unified database file.
///
/// Owns the read-write file handle and the exclusive lock. Dropped handles
/// release the lock with the file.
pub struct UnifiedFile {
    path: PathBuf,
    file: File,
    header: FileHeader,
}

fn map_header_error(e: HeaderError) -> Error {
    Error::IntegrityViolation(e.to_string())
}

impl UnifiedFile {
    /// Create a fresh, empty database file.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when the path exists; I/O errors otherwise.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::already_exists(path.display().to_string())
                } else {
                    Error::from(e)
                }
            })?;
        Self::lock(&file, path)?;

        let header = FileHeader::new_empty();
        let mut unified = UnifiedFile {
            path: path.to_path_buf(),
            file,
            header,
        };
        unified.rewrite_header(header)?;
        unified.file.sync_all()?;
        info!(path = %path.display(), "created unified database file");
        Ok(unified)
    }

    /// Open and validate an existing database file.
    ///
    /// # Errors
    ///
    /// - `IntegrityViolation` for bad magic, a failed header checksum, or a
    ///   format-version mismatch (all fatal at startup)
    /// - `Conflict` when another process holds the file lock
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::not_found(path.display().to_string())
                } else {
                    Error::from(e)
                }
            })?;
        Self::lock(&file, path)?;

        let mut header_bytes = [0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_bytes).map_err(|_| {
            Error::IntegrityViolation("file too small to hold a header".to_string())
        })?;
        let header = FileHeader::from_bytes(&header_bytes).map_err(map_header_error)?;

        info!(
            path = %path.display(),
            entities = header.entity_count,
            "opened unified database file"
        );
        Ok(UnifiedFile {
            path: path.to_path_buf(),
            file,
            header,
        })
    }

    /// Open the file, creating it when missing. Returns whether it was
    /// created.
    pub fn open_or_create(path: &Path) -> Result<(Self, bool)> {
        if path.exists() {
            Ok((Self::open(path)?, false))
        } else {
            Ok((Self::create(path)?, true))
        }
    }

    fn lock(file: &File, path: &Path) -> Result<()> {
        file.try_lock_exclusive().map_err(|_| Error::Conflict {
            id: path.display().to_string(),
            reason: "database file is locked by another process".to_string(),
        })
    }

    /// The validated header.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// The file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute offset where WAL appends begin.
    pub fn wal_start(&self) -> u64 {
        self.header.wal_offset
    }

    /// Current end of file — the WAL grows to here.
    pub fn wal_end(&mut self) -> Result<u64> {
        Ok(self.file.seek(SeekFrom::End(0))?)
    }

    /// Read the index section bytes for warm start.
    pub fn read_index_section(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.header.index_length as usize];
        self.file.seek(SeekFrom::Start(self.header.index_offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// A second handle on the same file, for the WAL writer or mmap.
    pub fn try_clone(&self) -> Result<File> {
        Ok(self.file.try_clone()?)
    }

    /// Rewrite the header in place and flush it.
    pub fn rewrite_header(&mut self, header: FileHeader) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.to_bytes())?;
        self.file.sync_data()?;
        self.header = header;
        Ok(())
    }

    /// Swap in the freshly checkpointed file.
    ///
    /// The checkpoint wrote a shadow file and renamed it over `path`; this
    /// installs the new handle (already locked) and header. The old handle
    /// — and any mmap over the old inode — stays valid until dropped.
    pub fn replace_after_checkpoint(&mut self, file: File, header: FileHeader) {
        self.file = file;
        self.header = header;
    }
}

impl std::fmt::Debug for UnifiedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedFile")
            .field("path", &self.path)
            .field("entity_count", &self.header.entity_count)
            .finish()
    }
}
