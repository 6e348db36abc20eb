//! Log entry writer
//!
//! Streams one log entry to its file, header first, then each operation,
//! the sentinel and the trailer, keeping a running checksum as it goes.
//! Every step is a separate write so a crash between steps leaves exactly
//! the prefix written so far.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{JournalError, Result};

use super::entry::{EntryHeader, LogOp, Trailer};

/// Writer for a single in-flight log entry
pub struct EntryWriter {
    /// Entry file path
    path: PathBuf,
    /// Entry file, exclusively locked for as long as the writer (or the
    /// handle it is turned into) lives
    file: File,
    /// Transaction id this entry belongs to
    id: u32,
    /// Number of non-sentinel operations written
    op_count: u32,
    /// Bytes written so far
    position: u64,
    /// Running CRC over header, operations and sentinel
    hasher: crc32fast::Hasher,
}

impl EntryWriter {
    /// Create (or truncate) the entry file and take its owner lock.
    ///
    /// Fails without touching the file when another handle owns it.
    pub fn create(path: &Path, id: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| JournalError::CreateEntry {
                path: path.to_path_buf(),
                source,
            })?;

        // Locked by a live owner: leave its content alone
        file.try_lock_exclusive()
            .and_then(|()| file.set_len(0))
            .map_err(|source| JournalError::CreateEntry {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            id,
            op_count: 0,
            position: 0,
            hasher: crc32fast::Hasher::new(),
        })
    }

    /// Write the entry header
    pub fn write_header(&mut self, header: &EntryHeader) -> Result<()> {
        let bytes = header.to_bytes();
        self.write_hashed(&bytes)
    }

    /// Write one operation header followed by its payload
    pub fn write_op(&mut self, op: &LogOp) -> Result<()> {
        let header = LogOp::header_bytes(op.data.len() as u32, op.offset);
        self.write_hashed(&header)?;
        self.write_hashed(&op.data)?;
        self.op_count += 1;
        Ok(())
    }

    /// Write the zero/zero sentinel that ends the operation list
    pub fn write_sentinel(&mut self) -> Result<()> {
        let sentinel = LogOp::header_bytes(0, 0);
        self.write_hashed(&sentinel)
    }

    /// Write the trailer (operation count and checksum)
    pub fn write_trailer(&mut self) -> Result<Trailer> {
        let trailer = Trailer {
            num_ops: self.op_count,
            checksum: self.hasher.clone().finalize(),
        };
        self.file
            .write_all(&trailer.to_bytes())
            .map_err(|source| self.write_error(source))?;
        self.position += trailer.to_bytes().len() as u64;
        Ok(trailer)
    }

    /// Flush the entry's data and metadata to storage
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|source| JournalError::JournalWrite {
                id: self.id,
                source,
            })?;

        if let Some(dir) = self.path.parent() {
            super::sync_dir(dir).map_err(|source| JournalError::JournalWrite {
                id: self.id,
                source,
            })?;
        }

        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Give up the writer, keeping the locked file handle alive
    pub fn into_parts(self) -> (File, PathBuf) {
        (self.file, self.path)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn write_hashed(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .map_err(|source| self.write_error(source))?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn write_error(&self, source: std::io::Error) -> JournalError {
        JournalError::JournalWrite {
            id: self.id,
            source,
        }
    }
}
