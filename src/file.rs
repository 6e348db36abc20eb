//! Journaled file handle
//!
//! [`JournaledFile`] owns an open target file and its journal. It exposes
//! transactions plus a small file-like façade:
//!
//! | Call                         | Journaled | Cursor |
//! |------------------------------|-----------|--------|
//! | `pwrite`, `pwritev`          | yes       | no     |
//! | `write`, `writev`            | yes       | yes    |
//! | `pread`, `preadv`            | no        | no     |
//! | `read`, `readv`, `seek`      | no        | yes    |
//! | `truncate`, `metadata`       | no        | no     |
//!
//! Offset-based calls take `&self` and may be issued from several threads at
//! once. Cursor-based calls take `&mut self`: the cursor is per handle, like
//! the position of an ordinary file descriptor.

use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::autosync::Autosync;
use crate::config::{AutosyncConfig, Config, RetirePolicy};
use crate::engine::Engine;
use crate::error::{JournalError, Result};
use crate::journal::{range_end, read_full_at};
use crate::testing::CrashPoint;
use crate::transaction::Transaction;

/// An open file whose writes go through a per-file write-ahead journal
pub struct JournaledFile {
    engine: Arc<Engine>,
    autosync: Mutex<Option<Autosync>>,
    cursor: u64,
}

impl JournaledFile {
    /// Open `path` with the given configuration
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let retire_policy = config.retire_policy;
        let engine = Arc::new(Engine::open(path.as_ref(), config)?);

        let file = Self {
            engine,
            autosync: Mutex::new(None),
            cursor: 0,
        };
        if let RetirePolicy::Autosync(autosync) = retire_policy {
            file.start_autosync(autosync)?;
        }
        Ok(file)
    }

    /// Open `path` with the default configuration (create, undo, immediate retire)
    pub fn open_default(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, Config::default())
    }

    /// Start building a transaction against this file
    pub fn new_transaction(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.engine))
    }

    // =========================================================================
    // Offset-based I/O
    // =========================================================================

    /// Read at `offset`; returns fewer bytes than requested only at end of file
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(read_full_at(self.engine.file(), buf, offset)?)
    }

    /// Read into consecutive buffers starting at `offset`
    pub fn preadv(&self, bufs: &mut [&mut [u8]], offset: u64) -> Result<usize> {
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let n = read_full_at(self.engine.file(), buf, offset.saturating_add(total as u64))?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Write `data` at `offset` as a single-write transaction
    pub fn pwrite(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.pwritev(&[data], offset)
    }

    /// Write consecutive buffers starting at `offset` as one transaction
    pub fn pwritev(&self, bufs: &[&[u8]], offset: u64) -> Result<usize> {
        let mut tx = self.new_transaction();
        let mut position = offset;
        for buf in bufs.iter().filter(|buf| !buf.is_empty()) {
            let len = buf.len() as u64;
            let end = range_end(position, len).ok_or(JournalError::OutOfRange {
                offset: position,
                len,
            })?;
            tx.add_write(position, Bytes::copy_from_slice(buf))?;
            position = end;
        }
        if tx.is_empty() {
            return Ok(0);
        }
        tx.commit()
    }

    // =========================================================================
    // Cursor-based I/O
    // =========================================================================

    /// Read at the cursor and advance it
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.pread(buf, self.cursor)?;
        self.cursor += n as u64;
        Ok(n)
    }

    pub fn readv(&mut self, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let n = self.preadv(bufs, self.cursor)?;
        self.cursor += n as u64;
        Ok(n)
    }

    /// Write at the cursor (journaled) and advance it
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let n = self.pwrite(data, self.cursor)?;
        self.cursor += n as u64;
        Ok(n)
    }

    pub fn writev(&mut self, bufs: &[&[u8]]) -> Result<usize> {
        let n = self.pwritev(bufs, self.cursor)?;
        self.cursor += n as u64;
        Ok(n)
    }

    /// Move the cursor; returns the new position
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(offset) => {
                self.cursor = offset;
                return Ok(offset);
            }
            SeekFrom::Current(delta) => (self.cursor, delta),
            SeekFrom::End(delta) => (self.len()?, delta),
        };

        let target = base.checked_add_signed(delta).ok_or_else(|| {
            JournalError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            ))
        })?;
        self.cursor = target;
        Ok(target)
    }

    /// Current cursor position
    pub fn position(&self) -> u64 {
        self.cursor
    }

    // =========================================================================
    // File Operations
    // =========================================================================

    /// Set the file length (not journaled)
    pub fn truncate(&self, len: u64) -> Result<()> {
        self.engine.truncate(len)
    }

    pub fn metadata(&self) -> Result<Metadata> {
        Ok(self.engine.file().metadata()?)
    }

    /// Current file length
    pub fn len(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Journal sync: flush the file and retire all lingering entries.
    ///
    /// Returns the number of entries retired.
    pub fn sync(&self) -> Result<usize> {
        self.engine.sync()
    }

    /// Move the journal directory (lingering entries are retired first)
    pub fn move_journal(&self, new_dir: impl AsRef<Path>) -> Result<()> {
        self.engine.move_journal(new_dir.as_ref())
    }

    // =========================================================================
    // Autosync
    // =========================================================================

    /// Start the autosync scheduler; a no-op when it is already running
    pub fn start_autosync(&self, config: AutosyncConfig) -> Result<()> {
        if !self.engine.config().retire_policy.lingers() {
            return Err(JournalError::Config(
                "autosync requires a lingering retire policy".to_string(),
            ));
        }

        let mut autosync = self.autosync.lock();
        if autosync.is_none() {
            *autosync = Some(Autosync::start(&self.engine, config)?);
        }
        Ok(())
    }

    /// Stop the autosync scheduler; a no-op when it is not running
    pub fn stop_autosync(&self) -> Result<()> {
        let running = self.autosync.lock().take();
        match running {
            Some(autosync) => autosync.stop(),
            None => Ok(()),
        }
    }

    pub fn autosync_running(&self) -> bool {
        self.autosync.lock().is_some()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop autosync, sync, and close the handle
    pub fn close(self) -> Result<()> {
        self.stop_autosync()?;
        self.engine.sync()?;
        debug!(path = %self.engine.path().display(), "closed journaled file");
        Ok(())
    }

    /// Arm a one-shot simulated crash for the next commit or sync on this handle
    pub fn inject_crash(&self, point: CrashPoint) {
        self.engine.inject_crash(point);
    }

    pub fn disarm_crash(&self) {
        self.engine.disarm_crash();
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        self.engine.path()
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.engine.journal_dir()
    }

    pub fn config(&self) -> &Config {
        self.engine.config()
    }

    /// Number of applied entries awaiting retirement
    pub fn pending(&self) -> usize {
        self.engine.pending()
    }

    /// Current value of the journal's id registry
    pub fn registry_count(&self) -> Result<u32> {
        self.engine.registry().count()
    }
}

impl Drop for JournaledFile {
    fn drop(&mut self) {
        if let Some(autosync) = self.autosync.get_mut().take() {
            if let Err(e) = autosync.stop() {
                warn!(error = %e, "autosync reported errors on close");
            }
        }
        if self.engine.pending() > 0 {
            if let Err(e) = self.engine.sync() {
                warn!(error = %e, "journal sync on close failed");
            }
        }
    }
}
