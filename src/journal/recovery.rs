//! Recovery Scanner
//!
//! Walks a journal directory, classifies every entry it finds and, when
//! asked to, repairs the target file and the directory.
//!
//! ## Classification
//! ```text
//! name not an id, or < 8 bytes ──► invalid       (left alone)
//! owner still holds entry lock ──► in_progress   (left alone)
//! structure/version/count fail ──► broken        (deleted on repair)
//! checksum mismatch            ──► corrupt       (deleted on repair)
//! offset past i64::MAX         ──► broken        (deleted on repair)
//! valid                        ──► reapplied     (replayed, then deleted)
//! valid, replay I/O failed     ──► apply_error   (kept for the next run)
//! ```
//!
//! A replay rejected by the file system itself (invalid offset, file too
//! large) can never succeed, so that entry is discarded as broken instead.
//!
//! Entries are processed in ascending id order so overlapping transactions
//! are replayed in the order they were logged. The whole scan holds the
//! same exclusive lock on the target that every commit takes, so it waits
//! for a handle that is mid-commit and blocks new commits until it is done.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::error::{JournalError, Result};

use super::entry::{DecodeCategory, LogEntry};
use super::registry::Registry;
use super::{
    default_journal_dir, parse_entry_id, sync_dir, write_all_at, TargetLock, BROKEN_MARKER,
    LOCK_FILENAME,
};

/// Per-category counts produced by a scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FsckReport {
    pub invalid: u64,
    pub broken: u64,
    pub corrupt: u64,
    pub in_progress: u64,
    pub reapplied: u64,
    pub apply_error: u64,
    pub total: u64,
}

impl FsckReport {
    /// True when the scan found nothing at all
    pub fn is_clean(&self) -> bool {
        self.total == 0
    }

    fn record(&mut self, category: Category) {
        match category {
            Category::Invalid => self.invalid += 1,
            Category::Broken => self.broken += 1,
            Category::Corrupt => self.corrupt += 1,
            Category::InProgress => self.in_progress += 1,
            Category::Reapplied => self.reapplied += 1,
            Category::ApplyError => self.apply_error += 1,
        }
        self.total += 1;
    }
}

impl fmt::Display for FsckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "invalid:     {}", self.invalid)?;
        writeln!(f, "broken:      {}", self.broken)?;
        writeln!(f, "corrupt:     {}", self.corrupt)?;
        writeln!(f, "in progress: {}", self.in_progress)?;
        writeln!(f, "reapplied:   {}", self.reapplied)?;
        writeln!(f, "apply error: {}", self.apply_error)?;
        write!(f, "total:       {}", self.total)
    }
}

#[derive(Debug, Clone, Copy)]
enum Category {
    Invalid,
    Broken,
    Corrupt,
    InProgress,
    Reapplied,
    ApplyError,
}

/// Scan the journal of `target`.
///
/// `journal_dir` overrides the default colocated directory. With `repair`
/// set, valid entries are replayed onto the target, broken and corrupt
/// entries are deleted, and an empty journal directory is removed.
///
/// Because of that last step, repeating a repairing `scan` on a journal it
/// fully cleaned fails with [`JournalError::NoJournal`]. A
/// [`Scanner`] with `cleanup(false)` keeps the directory, and its repeated
/// runs return an all-zero report.
pub fn scan(target: &Path, journal_dir: Option<&Path>, repair: bool) -> Result<FsckReport> {
    let mut scanner = Scanner::new(target).repair(repair);
    if let Some(dir) = journal_dir {
        scanner = scanner.journal_dir(dir);
    }
    scanner.run()
}

/// Configurable recovery scan
#[derive(Debug, Clone)]
pub struct Scanner {
    target: PathBuf,
    journal_dir: Option<PathBuf>,
    repair: bool,
    cleanup: bool,
}

impl Scanner {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            journal_dir: None,
            repair: false,
            cleanup: true,
        }
    }

    /// Scan this directory instead of the default `.{name}.jio`
    pub fn journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    /// Replay and delete entries instead of only counting them
    pub fn repair(mut self, repair: bool) -> Self {
        self.repair = repair;
        self
    }

    /// Remove the journal directory after a repair that left it empty
    pub fn cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Run the scan
    pub fn run(&self) -> Result<FsckReport> {
        if !self.target.exists() {
            return Err(JournalError::NotFound(self.target.clone()));
        }
        let dir = match &self.journal_dir {
            Some(dir) => dir.clone(),
            None => default_journal_dir(&self.target),
        };
        if !dir.is_dir() {
            return Err(JournalError::NoJournal(dir));
        }

        let target = OpenOptions::new()
            .read(true)
            .write(self.repair)
            .open(&self.target)?;
        let _lock = TargetLock::acquire(&target)?;

        debug!(target = %self.target.display(), dir = %dir.display(), repair = self.repair, "scanning journal");

        // Step 1: split directory contents into entry ids and stray names
        let mut report = FsckReport::default();
        let mut ids = Vec::new();
        for dirent in fs::read_dir(&dir)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            if name == LOCK_FILENAME || name == BROKEN_MARKER {
                continue;
            }
            match parse_entry_id(&name) {
                Some(id) if dirent.file_type()?.is_file() => ids.push(id),
                _ => {
                    trace!(name = %name, "not a log entry");
                    report.record(Category::Invalid);
                }
            }
        }
        ids.sort_unstable();

        // Step 2: classify (and repair) each entry in log order
        let mut removed_any = false;
        for id in ids {
            let path = dir.join(id.to_string());
            let category = self.process_entry(id, &path, &target, &mut removed_any)?;
            report.record(category);
        }

        // Step 3: rebuild bookkeeping
        if self.repair {
            if removed_any {
                sync_dir(&dir)?;
            }
            self.finish_repair(&dir, report.apply_error == 0)?;
        }

        info!(
            target = %self.target.display(),
            invalid = report.invalid,
            broken = report.broken,
            corrupt = report.corrupt,
            in_progress = report.in_progress,
            reapplied = report.reapplied,
            apply_error = report.apply_error,
            repair = self.repair,
            "journal scan complete"
        );
        Ok(report)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn process_entry(
        &self,
        id: u32,
        path: &Path,
        target: &File,
        removed_any: &mut bool,
    ) -> Result<Category> {
        let mut file = File::open(path)?;

        // A live owner keeps its entry locked until retirement
        if let Err(e) = file.try_lock_exclusive() {
            if is_contended(&e) {
                trace!(id, "entry owned by a live handle");
                return Ok(Category::InProgress);
            }
            return Err(e.into());
        }

        let entry = match LogEntry::read_from(&mut file) {
            Ok(entry) => entry,
            Err(JournalError::Decode(e)) => {
                let category = match e.category() {
                    DecodeCategory::Invalid => {
                        trace!(id, error = %e, "entry too short to parse");
                        return Ok(Category::Invalid);
                    }
                    DecodeCategory::Broken => Category::Broken,
                    DecodeCategory::Corrupt => Category::Corrupt,
                };
                warn!(id, error = %e, "discarding damaged log entry");
                if self.repair {
                    fs::remove_file(path)?;
                    *removed_any = true;
                }
                return Ok(category);
            }
            Err(e) => return Err(e),
        };

        if self.repair {
            let replayed = entry
                .ops
                .iter()
                .try_for_each(|op| write_all_at(target, &op.data, op.offset))
                .and_then(|()| target.sync_all());
            if let Err(e) = replayed {
                if !is_unreplayable(&e) {
                    warn!(id, error = %e, "failed to reapply log entry, keeping it");
                    return Ok(Category::ApplyError);
                }
                warn!(id, error = %e, "log entry cannot be applied to the target, discarding");
                fs::remove_file(path)?;
                *removed_any = true;
                return Ok(Category::Broken);
            }
            fs::remove_file(path)?;
            *removed_any = true;
            debug!(id, ops = entry.ops.len(), bytes = entry.payload_len(), "reapplied log entry");
        }

        Ok(Category::Reapplied)
    }

    /// `clear_marker` is false while replayable work is still left behind
    fn finish_repair(&self, dir: &Path, clear_marker: bool) -> Result<()> {
        let registry = Registry::new(dir);

        let mut highest = 0;
        for dirent in fs::read_dir(dir)? {
            let name = dirent?.file_name();
            if let Some(id) = parse_entry_id(&name.to_string_lossy()) {
                highest = highest.max(id);
            }
        }
        if highest > 0 || dir.join(LOCK_FILENAME).exists() {
            registry.store(highest)?;
        }

        let marker = dir.join(BROKEN_MARKER);
        if clear_marker && marker.exists() {
            fs::remove_file(&marker)?;
            info!(dir = %dir.display(), "cleared broken journal marker");
        }

        if self.cleanup {
            registry.remove_if_empty()?;
        }
        Ok(())
    }
}

/// Replay errors the file system will return on every retry
fn is_unreplayable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::FileTooLarge
    )
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
