//! Engine Module
//!
//! The commit engine that coordinates the journal and the target file.
//!
//! ## Responsibilities
//! - Run the log-then-apply-then-retire commit protocol
//! - Capture undo pre-images while applying
//! - Keep lingering entries until a journal sync retires them
//! - Mark the journal broken when a logged transaction cannot be applied
//!
//! ## Commit Protocol
//! ```text
//!  1. acquire id ─┐
//!  2. create entry┘ (under the registry lock)
//!  3. header
//!  4. ops + sentinel         failure here: target untouched,
//!  5. trailer                entry removed, id released
//!  6. fsync entry + dir
//!  ─────────────────────────────────────────────────────────
//!  7. apply writes           failure here: entry stays for replay,
//!  8. fsync target           journal marked broken
//!  ─────────────────────────────────────────────────────────
//!  9. delete entry, release id (or linger until sync)
//! ```

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::autosync::Notifier;
use crate::config::Config;
use crate::error::{JournalError, Result};
use crate::journal::{
    default_journal_dir, read_full_at, sync_dir, write_all_at, EntryHeader, EntryWriter, LogOp,
    Registry, TargetLock, BROKEN_MARKER, FLAG_LINGER,
};
use crate::testing::{CrashInjector, CrashPoint};
use crate::transaction::{compose_read, TxOp};

/// Per-commit options chosen by the transaction
#[derive(Debug, Clone, Copy)]
pub(crate) struct CommitOptions {
    /// Entry header flags
    pub flags: u16,
    /// Capture pre-images while applying
    pub capture_undo: bool,
}

/// Result of a successful commit
#[derive(Debug)]
pub(crate) struct CommitOutcome {
    /// Id the entry was logged under (None when nothing was written)
    pub id: Option<u32>,
    /// Payload bytes applied
    pub written: usize,
    /// Read buffers in the order the reads were added
    pub reads: Vec<Vec<u8>>,
    /// Pre-images, when capture was requested
    pub undo: Option<UndoLog>,
}

/// Pre-images captured while a transaction was applied
#[derive(Debug, Clone)]
pub(crate) struct UndoLog {
    /// One image per write, in application order
    pub images: Vec<UndoImage>,
    /// File length before the transaction
    pub original_len: u64,
    /// File length right after the transaction
    pub committed_len: u64,
}

impl UndoLog {
    pub fn grew_file(&self) -> bool {
        self.committed_len > self.original_len
    }
}

/// Content of a range before a write replaced it (short when the write
/// extended the file)
#[derive(Debug, Clone)]
pub(crate) struct UndoImage {
    pub offset: u64,
    pub data: Bytes,
}

/// Applied entry whose owner lock is still held
struct OwnedEntry {
    id: u32,
    /// Keeps the entry's advisory lock alive
    _file: File,
}

/// The commit engine for one open target file
///
/// ## Concurrency Model
///
/// - **Commits** (and truncates): serialized by `commit_lock` within the
///   handle and by an exclusive lock on the target file across handles
///   - Lock order: commit_lock → target flock → registry → lingering
///
/// - **Retirement** (journal sync, autosync ticks): serialized by the
///   `lingering` mutex; an entry leaves the list before it is retired, so
///   no id is released twice
///
/// - **Plain reads**: positioned reads on `file`, no locking
pub(crate) struct Engine {
    /// Target file path
    path: PathBuf,

    /// Target file
    file: File,

    /// Open-time configuration
    config: Config,

    /// Id registry of the journal directory
    registry: Registry,

    /// Applied entries awaiting retirement (linger mode), oldest first
    lingering: Mutex<Vec<OwnedEntry>>,

    /// Serializes commits through this handle
    commit_lock: Mutex<()>,

    /// Wakes the autosync scheduler when enough entries linger
    notifier: Mutex<Option<Notifier>>,

    /// Armed crash point, if any
    crash: CrashInjector,
}

impl Engine {
    /// Open the target file and attach its journal
    ///
    /// The journal directory itself is created lazily by the first commit.
    pub fn open(path: &Path, config: Config) -> Result<Self> {
        if let crate::config::RetirePolicy::Autosync(autosync) = &config.retire_policy {
            autosync.validate()?;
        }

        // Step 1: Open the target file
        let mut options = OpenOptions::new();
        options.read(true);
        if !config.read_only {
            options
                .write(true)
                .create(config.create)
                .truncate(config.truncate);
        }
        let file = options.open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => JournalError::NotFound(path.to_path_buf()),
            _ => JournalError::Io(e),
        })?;

        // Step 2: Resolve the journal directory
        let journal_dir = match &config.journal_dir {
            Some(dir) => dir.clone(),
            None => default_journal_dir(path),
        };

        debug!(
            path = %path.display(),
            journal = %journal_dir.display(),
            read_only = config.read_only,
            undo = config.undo,
            "opened journaled file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            registry: Registry::new(journal_dir),
            config,
            lingering: Mutex::new(Vec::new()),
            commit_lock: Mutex::new(()),
            notifier: Mutex::new(None),
            crash: CrashInjector::default(),
        })
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commit an ordered list of operations
    pub fn commit(&self, ops: &[TxOp], options: CommitOptions) -> Result<CommitOutcome> {
        if self.config.read_only {
            return Err(JournalError::ReadOnly);
        }

        let writes: Vec<&LogOp> = ops
            .iter()
            .filter_map(|op| match op {
                TxOp::Write(write) => Some(write),
                TxOp::Read { .. } => None,
            })
            .collect();

        let _order = self.commit_lock.lock();
        let _target = TargetLock::acquire(&self.file)?;

        // Reads see the file as of now, overlaid with earlier writes
        let reads = self.compose_reads(ops)?;

        if writes.is_empty() {
            return Ok(CommitOutcome {
                id: None,
                written: 0,
                reads,
                undo: None,
            });
        }

        self.check_not_broken()?;

        let mut flags = options.flags;
        if self.config.retire_policy.lingers() {
            flags |= FLAG_LINGER;
        }

        // Step 1-2: Allocate an id and create its entry under the registry lock
        let (id, mut writer) = self.registry.acquire_id_with(|id| {
            let writer = EntryWriter::create(&self.registry.entry_path(id), id)?;
            self.crash.check(CrashPoint::AfterCreate)?;
            Ok(writer)
        })?;

        // Step 3-6: Log the transaction and make the entry durable
        if let Err(e) = self.write_entry(&mut writer, flags, &writes) {
            if !matches!(e, JournalError::SimulatedCrash(_)) {
                self.abandon_entry(writer);
            }
            return Err(e);
        }
        debug!(id, ops = writes.len(), "log entry durable");

        // Step 7-8: Apply to the target and make it durable
        let undo = match self.apply(id, &writes, options.capture_undo) {
            Ok(undo) => undo,
            Err(e @ JournalError::SimulatedCrash(_)) => return Err(e),
            Err(e) => {
                self.mark_broken(id);
                return Err(e);
            }
        };
        let written = writes.iter().map(|op| op.data.len()).sum();

        // Step 9: Retire, or keep the entry until the next journal sync
        let (file, _) = writer.into_parts();
        let entry = OwnedEntry { id, _file: file };
        if self.config.retire_policy.lingers() {
            let pending = {
                let mut lingering = self.lingering.lock();
                lingering.push(entry);
                lingering.len()
            };
            trace!(id, pending, "entry lingering");
            if let Some(notifier) = self.notifier.lock().as_ref() {
                notifier.notify(pending);
            }
        } else {
            self.retire(entry)?;
        }

        Ok(CommitOutcome {
            id: Some(id),
            written,
            reads,
            undo,
        })
    }

    fn write_entry(&self, writer: &mut EntryWriter, flags: u16, writes: &[&LogOp]) -> Result<()> {
        let id = writer.id();

        writer.write_header(&EntryHeader::new(id, flags))?;
        self.crash.check(CrashPoint::AfterHeader)?;

        for (i, op) in writes.iter().enumerate() {
            writer.write_op(op)?;
            if i == 0 {
                self.crash.check(CrashPoint::AfterFirstOp)?;
            }
        }
        writer.write_sentinel()?;
        self.crash.check(CrashPoint::AfterOps)?;

        let trailer = writer.write_trailer()?;
        trace!(id, num_ops = trailer.num_ops, checksum = trailer.checksum, "trailer written");

        writer.sync()?;
        self.crash.check(CrashPoint::AfterLogSync)
    }

    fn apply(&self, id: u32, writes: &[&LogOp], capture_undo: bool) -> Result<Option<UndoLog>> {
        let apply_err = |source| JournalError::Apply { id, source };

        let original_len = self.file.metadata().map_err(apply_err)?.len();
        let mut images = Vec::new();

        for (i, op) in writes.iter().enumerate() {
            // Captured one write at a time so overlapping writes nest
            if capture_undo {
                let mut buf = vec![0u8; op.data.len()];
                let n = read_full_at(&self.file, &mut buf, op.offset).map_err(apply_err)?;
                buf.truncate(n);
                images.push(UndoImage {
                    offset: op.offset,
                    data: Bytes::from(buf),
                });
            }

            write_all_at(&self.file, &op.data, op.offset).map_err(apply_err)?;
            trace!(id, offset = op.offset, len = op.data.len(), "applied write");

            if i == 0 {
                self.crash.check(CrashPoint::AfterFirstApply)?;
            }
        }

        self.file.sync_all().map_err(apply_err)?;
        self.crash.check(CrashPoint::AfterApply)?;

        if !capture_undo {
            return Ok(None);
        }
        let committed_len = self.file.metadata().map_err(apply_err)?.len();
        Ok(Some(UndoLog {
            images,
            original_len,
            committed_len,
        }))
    }

    fn compose_reads(&self, ops: &[TxOp]) -> Result<Vec<Vec<u8>>> {
        let mut reads = Vec::new();
        if !ops.iter().any(|op| matches!(op, TxOp::Read { .. })) {
            return Ok(reads);
        }

        let file_len = self.file.metadata()?.len();
        let mut earlier = Vec::new();
        for op in ops {
            match op {
                TxOp::Write(write) => earlier.push(write),
                TxOp::Read { offset, len } => {
                    let mut base = vec![0u8; *len];
                    let n = read_full_at(&self.file, &mut base, *offset)?;
                    base.truncate(n);
                    reads.push(compose_read(base, file_len, *offset, *len, &earlier));
                }
            }
        }
        Ok(reads)
    }

    // =========================================================================
    // Retirement
    // =========================================================================

    /// Delete an applied entry and release its id
    fn retire(&self, entry: OwnedEntry) -> Result<()> {
        let id = entry.id;
        let path = self.registry.entry_path(id);

        fs::remove_file(&path).map_err(|source| JournalError::Retire { id, source })?;
        drop(entry);
        if let Some(dir) = path.parent() {
            sync_dir(dir).map_err(|source| JournalError::Retire { id, source })?;
        }

        self.crash.check(CrashPoint::BeforeRelease)?;
        self.registry.release_id(id).map_err(|e| match e {
            JournalError::Io(source) => JournalError::Retire { id, source },
            other => other,
        })?;

        debug!(id, "retired transaction");
        Ok(())
    }

    /// Journal sync: flush the target and retire every lingering entry.
    ///
    /// Returns the number of entries retired.
    pub fn sync(&self) -> Result<usize> {
        let mut lingering = self.lingering.lock();

        if !self.config.read_only {
            self.file.sync_all()?;
        }
        if lingering.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.crash.check(CrashPoint::BeforeSyncUnlink) {
            lingering.clear();
            return Err(e);
        }

        let mut retired = 0;
        let mut entries = std::mem::take(&mut *lingering).into_iter();
        while let Some(entry) = entries.next() {
            let id = entry.id;
            match self.retire(entry) {
                Ok(()) => retired += 1,
                Err(e @ JournalError::SimulatedCrash(_)) => return Err(e),
                Err(e) => {
                    warn!(id, error = %e, "failed to retire lingering entry");
                    lingering.extend(entries);
                    return Err(e);
                }
            }
        }

        debug!(retired, "journal sync complete");
        Ok(retired)
    }

    /// Drop a partially written entry after a logging failure
    fn abandon_entry(&self, writer: EntryWriter) {
        let id = writer.id();
        let (file, path) = writer.into_parts();

        if let Err(e) = fs::remove_file(&path) {
            warn!(id, error = %e, "failed to remove abandoned log entry");
        }
        drop(file);
        if let Some(dir) = path.parent() {
            let _ = sync_dir(dir);
        }
        if let Err(e) = self.registry.release_id(id) {
            warn!(id, error = %e, "failed to release abandoned transaction id");
        }
    }

    fn mark_broken(&self, id: u32) {
        let dir = self.registry.dir();
        let marked = File::create(dir.join(BROKEN_MARKER)).and_then(|_| sync_dir(&dir));
        match marked {
            Ok(()) => warn!(id, dir = %dir.display(), "apply failed, journal marked broken"),
            Err(e) => warn!(id, error = %e, "apply failed and the broken marker could not be written"),
        }
    }

    fn check_not_broken(&self) -> Result<()> {
        let dir = self.registry.dir();
        if dir.join(BROKEN_MARKER).exists() {
            return Err(JournalError::JournalBroken(dir));
        }
        Ok(())
    }

    // =========================================================================
    // File Operations
    // =========================================================================

    /// Truncate (or extend) the target and make the new length durable
    pub fn truncate(&self, len: u64) -> Result<()> {
        if self.config.read_only {
            return Err(JournalError::ReadOnly);
        }
        let _order = self.commit_lock.lock();
        let _target = TargetLock::acquire(&self.file)?;

        self.file.set_len(len)?;
        self.file.sync_all()?;
        trace!(len, "truncated target");
        Ok(())
    }

    /// Sync, then move the journal directory to `new_dir`
    pub fn move_journal(&self, new_dir: &Path) -> Result<()> {
        let _order = self.commit_lock.lock();
        self.sync()?;

        let old_dir = self.registry.dir();
        if old_dir.exists() {
            fs::rename(&old_dir, new_dir)?;
            if let Some(parent) = new_dir.parent() {
                sync_dir(parent)?;
            }
            if let Some(parent) = old_dir.parent() {
                sync_dir(parent)?;
            }
        }
        self.registry.relocate(new_dir.to_path_buf());

        info!(from = %old_dir.display(), to = %new_dir.display(), "moved journal");
        Ok(())
    }

    /// Arm a one-shot simulated crash
    pub fn inject_crash(&self, point: CrashPoint) {
        self.crash.arm(point);
    }

    pub fn disarm_crash(&self) {
        self.crash.disarm();
    }

    pub(crate) fn set_notifier(&self, notifier: Option<Notifier>) {
        *self.notifier.lock() = notifier;
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.registry.dir()
    }

    /// Number of applied entries awaiting retirement
    pub fn pending(&self) -> usize {
        self.lingering.lock().len()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.lingering.get_mut().is_empty() {
            return;
        }
        if let Err(e) = self.sync() {
            warn!(path = %self.path.display(), error = %e, "journal sync on drop failed");
        }
    }
}
