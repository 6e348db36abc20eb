//! Transaction id registry
//!
//! A single big-endian `u32` in `<journal>/lock` holding the highest
//! transaction id currently in flight. Every read-modify-write happens under
//! an exclusive advisory lock on that file (cross-process) and a mutex
//! (cross-thread, since advisory locks are per open file description).
//!
//! ## Concurrency:
//! - `guard`: serializes registry updates made through this handle
//! - the `lock` file's flock: serializes updates across handles and processes
//! - nothing is cached; every call re-reads the counter from disk

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::{JournalError, Result};

use super::{parse_entry_id, LOCK_FILENAME};

/// Size of the registry record
pub const REGISTRY_SIZE: u64 = 4;

/// Process-safe allocator for transaction ids of one journal directory
pub struct Registry {
    /// Journal directory (may be relocated)
    dir: RwLock<PathBuf>,
    /// Serializes updates from threads sharing this handle
    guard: Mutex<()>,
}

/// The registry file, locked exclusively until dropped
struct LockedRegistry {
    file: File,
}

impl Registry {
    /// Create a registry for the given journal directory.
    ///
    /// Nothing is created on disk until the first id is acquired.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: RwLock::new(dir.into()),
            guard: Mutex::new(()),
        }
    }

    /// Current journal directory
    pub fn dir(&self) -> PathBuf {
        self.dir.read().clone()
    }

    /// Path of the log entry for `id`
    pub fn entry_path(&self, id: u32) -> PathBuf {
        self.dir.read().join(id.to_string())
    }

    /// Allocate the next transaction id.
    ///
    /// Creates the journal directory on first use. The incremented counter
    /// is synced before the id is returned; on overflow the counter is left
    /// untouched and `IdOverflow` is returned.
    pub fn acquire_id(&self) -> Result<u32> {
        self.acquire_id_with(|_| Ok(())).map(|(id, ())| id)
    }

    /// Allocate an id and run `claim` with it while the registry is still
    /// locked.
    ///
    /// `claim` is where the caller creates the entry file: a concurrent
    /// release scanning for surviving entries can then never lower the
    /// counter below an id whose file is about to appear. If `claim` fails
    /// the allocation is undone before the error is returned (except for a
    /// simulated crash, which leaves the counter as a dead process would).
    pub fn acquire_id_with<T>(&self, claim: impl FnOnce(u32) -> Result<T>) -> Result<(u32, T)> {
        let _guard = self.guard.lock();
        let dir = self.dir();

        fs::create_dir_all(&dir)?;
        let mut locked = LockedRegistry::open(&dir)?;

        let current = locked.read()?;
        let id = current.checked_add(1).ok_or(JournalError::IdOverflow)?;
        locked.write(id)?;
        debug!(id, dir = %dir.display(), "allocated transaction id");

        match claim(id) {
            Ok(claimed) => Ok((id, claimed)),
            Err(e @ JournalError::SimulatedCrash(_)) => Err(e),
            Err(e) => {
                let previous = highest_entry_below(&dir, id)?;
                locked.write(previous)?;
                Err(e)
            }
        }
    }

    /// Release a transaction id.
    ///
    /// The counter only moves when `id` is the current maximum; it then
    /// drops to the highest id whose entry is still on disk. Once nothing
    /// is in flight and no entries remain, the journal directory is removed.
    pub fn release_id(&self, id: u32) -> Result<()> {
        let _guard = self.guard.lock();
        let dir = self.dir();

        if !dir.join(LOCK_FILENAME).exists() {
            return Ok(());
        }

        let mut locked = LockedRegistry::open(&dir)?;
        let mut current = locked.read()?;

        if id == current {
            current = highest_entry_below(&dir, id)?;
            locked.write(current)?;
        }
        trace!(id, counter = current, "released transaction id");

        if current == 0 && journal_is_empty(&dir)? {
            // Still holding the flock: waiters notice the unlinked inode and retry
            fs::remove_file(dir.join(LOCK_FILENAME))?;
            remove_journal_dir(&dir);
        }

        Ok(())
    }

    /// Number of ids currently accounted for (the high-water mark)
    pub fn count(&self) -> Result<u32> {
        let _guard = self.guard.lock();
        let dir = self.dir();

        if !dir.join(LOCK_FILENAME).exists() {
            return Ok(0);
        }

        let mut locked = LockedRegistry::open(&dir)?;
        locked.read()
    }

    /// Overwrite the counter (used by recovery after it rebuilds the journal)
    pub fn store(&self, value: u32) -> Result<()> {
        let _guard = self.guard.lock();
        let dir = self.dir();

        fs::create_dir_all(&dir)?;
        let mut locked = LockedRegistry::open(&dir)?;
        locked.write(value)
    }

    /// Remove the journal directory if it holds nothing but a zero counter.
    ///
    /// Returns whether the directory is gone afterwards.
    pub fn remove_if_empty(&self) -> Result<bool> {
        let _guard = self.guard.lock();
        let dir = self.dir();

        if !dir.exists() {
            return Ok(true);
        }
        if !journal_is_empty(&dir)? {
            return Ok(false);
        }

        let lock_path = dir.join(LOCK_FILENAME);
        if lock_path.exists() {
            let mut locked = LockedRegistry::open(&dir)?;
            if locked.read()? != 0 {
                return Ok(false);
            }
            fs::remove_file(&lock_path)?;
        }
        Ok(remove_journal_dir(&dir))
    }

    /// Point the registry at a relocated journal directory
    pub(crate) fn relocate(&self, new_dir: PathBuf) {
        let _guard = self.guard.lock();
        *self.dir.write() = new_dir;
    }
}

impl LockedRegistry {
    /// Open and exclusively lock the registry file of `dir`.
    ///
    /// Retries when the file it locked was unlinked by a concurrent teardown.
    fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILENAME);

        loop {
            fs::create_dir_all(dir)?;
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
            {
                Ok(file) => file,
                // Directory torn down between create_dir_all and open
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            file.lock_exclusive()?;

            if still_linked(&file, &path)? {
                return Ok(Self { file });
            }
            trace!(path = %path.display(), "registry file replaced while waiting, retrying");
        }
    }

    fn read(&mut self) -> Result<u32> {
        if self.file.metadata()?.len() != REGISTRY_SIZE {
            return Ok(0);
        }

        let mut buf = [0u8; REGISTRY_SIZE as usize];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn write(&mut self, value: u32) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&value.to_be_bytes())?;
        self.file.set_len(REGISTRY_SIZE)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for LockedRegistry {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

/// Highest id below `below` that still has an entry file, or 0
fn highest_entry_below(dir: &Path, below: u32) -> Result<u32> {
    let mut highest = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = parse_entry_id(&entry.file_name().to_string_lossy()) {
            if id < below && id > highest {
                highest = id;
            }
        }
    }
    Ok(highest)
}

/// Remove an emptied journal directory; another handle may already be
/// repopulating it, in which case it stays
fn remove_journal_dir(dir: &Path) -> bool {
    match fs::remove_dir(dir) {
        Ok(()) => {
            debug!(dir = %dir.display(), "removed empty journal directory");
            true
        }
        Err(e) => {
            trace!(dir = %dir.display(), error = %e, "journal directory left in place");
            false
        }
    }
}

/// True when the directory holds nothing besides the registry file
fn journal_is_empty(dir: &Path) -> Result<bool> {
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        if name != LOCK_FILENAME {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let locked = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(locked.ino() == current.ino() && locked.dev() == current.dev()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> Result<bool> {
    Ok(path.exists())
}
