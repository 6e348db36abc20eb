//! Configuration for walfile
//!
//! Centralized open-time configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{JournalError, Result};

/// Open-time configuration for a [`JournaledFile`](crate::JournaledFile)
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Journal Location
    // -------------------------------------------------------------------------
    /// Journal directory override.
    ///
    /// `None` uses the colocated hidden directory:
    ///   {parent}/
    ///     ├── {name}              (target file)
    ///     └── .{name}.jio/        (journal directory)
    ///           ├── lock          (id registry)
    ///           └── 1, 2, ...     (one log entry per in-flight transaction)
    pub journal_dir: Option<PathBuf>,

    // -------------------------------------------------------------------------
    // Target File
    // -------------------------------------------------------------------------
    /// Create the target file if it does not exist
    pub create: bool,

    /// Truncate the target file on open
    pub truncate: bool,

    /// Open without write access; transactions are rejected
    pub read_only: bool,

    // -------------------------------------------------------------------------
    // Transaction Behaviour
    // -------------------------------------------------------------------------
    /// Capture undo pre-images at commit time (required for rollback)
    pub undo: bool,

    /// When committed entries are retired
    pub retire_policy: RetirePolicy,
}

/// When a committed, applied log entry is deleted and its id released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetirePolicy {
    /// Retire as the last step of every commit (safest, one extra unlink per commit)
    Immediate,

    /// Keep entries until an explicit `sync()` (batched retirement)
    Linger,

    /// Linger, and run the autosync scheduler from open until close
    Autosync(AutosyncConfig),
}

impl RetirePolicy {
    /// Whether committed entries are kept around after apply
    pub fn lingers(&self) -> bool {
        !matches!(self, RetirePolicy::Immediate)
    }
}

/// Autosync cadence: retire when either bound is reached, whichever first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosyncConfig {
    /// Retire once this many lingering entries have accumulated
    pub max_pending: usize,

    /// Retire at least this often
    pub interval: Duration,
}

impl AutosyncConfig {
    pub fn new(max_pending: usize, interval: Duration) -> Self {
        Self {
            max_pending,
            interval,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_pending == 0 {
            return Err(JournalError::Config(
                "autosync max_pending must be at least 1".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(JournalError::Config(
                "autosync interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AutosyncConfig {
    fn default() -> Self {
        Self {
            max_pending: 64,
            interval: Duration::from_secs(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            journal_dir: None,
            create: true,
            truncate: false,
            read_only: false,
            undo: true,
            retire_policy: RetirePolicy::Immediate,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Use a journal directory other than the colocated default
    pub fn journal_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.journal_dir = Some(path.into());
        self
    }

    /// Create the target file if missing
    pub fn create(mut self, create: bool) -> Self {
        self.config.create = create;
        self
    }

    /// Truncate the target file on open
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.config.truncate = truncate;
        self
    }

    /// Open the target without write access
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Enable or disable undo capture (disabling makes rollback fail)
    pub fn undo(mut self, undo: bool) -> Self {
        self.config.undo = undo;
        self
    }

    /// Set the retire policy
    pub fn retire_policy(mut self, policy: RetirePolicy) -> Self {
        self.config.retire_policy = policy;
        self
    }

    /// Shorthand for `RetirePolicy::Linger`
    pub fn linger(self) -> Self {
        self.retire_policy(RetirePolicy::Linger)
    }

    /// Shorthand for `RetirePolicy::Autosync`
    pub fn autosync(self, max_pending: usize, interval: Duration) -> Self {
        self.retire_policy(RetirePolicy::Autosync(AutosyncConfig::new(
            max_pending,
            interval,
        )))
    }

    pub fn build(self) -> Config {
        self.config
    }
}
