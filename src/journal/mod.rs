//! Journal Module
//!
//! Per-file write-ahead journal: on-disk log entries, the transaction id
//! registry, and the recovery scanner.
//!
//! ## Responsibilities
//! - Serialize each transaction to its own log entry before it is applied
//! - Checksum every entry so torn or bit-rotted entries are never replayed
//! - Allocate and release transaction ids safely across processes
//! - Classify and repair leftover entries after a crash
//!
//! ## Directory Layout
//! ```text
//! .{name}.jio/
//!   ├── lock      registry: highest in-flight id (u32, big-endian)
//!   ├── broken    present only after a failed apply, until recovery runs
//!   ├── 1         log entry for transaction 1
//!   └── 2         ...
//! ```
//!
//! ## Entry Format (all integers big-endian)
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Header (8)                                  │
//! │ ┌─────────────┬───────────┬───────────────┐ │
//! │ │ Version (2) │ Flags (2) │ Id (4)        │ │
//! │ └─────────────┴───────────┴───────────────┘ │
//! ├─────────────────────────────────────────────┤
//! │ Operation 1                                 │
//! │ ┌─────────┬────────────┬──────────────────┐ │
//! │ │ Len (4) │ Offset (8) │ Payload (Len)    │ │
//! │ └─────────┴────────────┴──────────────────┘ │
//! │ ... (repeated for each write)               │
//! ├─────────────────────────────────────────────┤
//! │ Sentinel: Len = 0, Offset = 0 (12)          │
//! ├─────────────────────────────────────────────┤
//! │ Trailer (8)                                 │
//! │ ┌───────────────┬─────────────────────────┐ │
//! │ │ NumOps (4)    │ CRC32 (4)               │ │
//! │ └───────────────┴─────────────────────────┘ │
//! └─────────────────────────────────────────────┘
//! ```
//! The CRC covers header, operations and sentinel, never the trailer.

mod entry;
mod recovery;
mod registry;
mod writer;

use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

pub use entry::{
    checksum, range_end, DecodeCategory, DecodeError, EntryHeader, LogEntry, LogOp, Trailer,
    ENTRY_VERSION, FLAG_LINGER, FLAG_NO_ROLLBACK, FLAG_ROLLBACK, HEADER_SIZE, MAX_OFFSET,
    OP_HEADER_SIZE, TRAILER_SIZE,
};
pub use recovery::{scan, FsckReport, Scanner};
pub use registry::{Registry, REGISTRY_SIZE};
pub use writer::EntryWriter;

/// Registry file name inside the journal directory
pub const LOCK_FILENAME: &str = "lock";

/// Marker left behind when a logged transaction could not be applied
pub const BROKEN_MARKER: &str = "broken";

/// Default journal directory for a target file: `<parent>/.<name>.jio`
pub fn default_journal_dir(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    parent.join(format!(".{}.jio", name))
}

/// Parse a log entry file name: "42" → Some(42); ids start at 1
pub fn parse_entry_id(name: &str) -> Option<u32> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match name.parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(id) => Some(id),
    }
}

/// Exclusive advisory lock on the target file, released on drop.
///
/// Held by every commit and by every recovery scan, so replayed writes
/// never interleave with a live handle applying its own.
pub(crate) struct TargetLock<'a> {
    file: &'a std::fs::File,
}

impl<'a> TargetLock<'a> {
    pub(crate) fn acquire(file: &'a std::fs::File) -> io::Result<Self> {
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for TargetLock<'_> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Flush a directory's metadata (entry creation/removal) to storage
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

// =============================================================================
// Positioned I/O
// =============================================================================

/// Read up to `buf.len()` bytes at `offset`, stopping early only at end of file
pub(crate) fn read_full_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match read_at(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Write all of `data` at `offset`, extending the file if needed
pub(crate) fn write_all_at(file: &std::fs::File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    while !data.is_empty() {
        match write_at(file, data, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                data = &data[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &std::fs::File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &std::fs::File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}
