//! Error types for walfile
//!
//! Provides a unified error type for all operations. Variants are grouped by
//! how the caller is expected to react: resource and protocol errors are
//! reported at the call that hit them, commit-window errors tell the caller
//! whether recovery has work left to do, and decode errors only surface from
//! the recovery scanner.

use std::path::PathBuf;

use thiserror::Error;

use crate::journal::DecodeError;
use crate::testing::CrashPoint;

/// Result type alias using JournalError
pub type Result<T> = std::result::Result<T, JournalError>;

/// Unified error type for walfile operations
#[derive(Debug, Error)]
pub enum JournalError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    #[error("No such file: {}", .0.display())]
    NotFound(PathBuf),

    #[error("No journal directory at {}", .0.display())]
    NoJournal(PathBuf),

    #[error("Transaction id counter overflow")]
    IdOverflow,

    #[error("Cannot create log entry {}: {source}", path.display())]
    CreateEntry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Zero-length writes are not allowed")]
    ZeroLengthWrite,

    #[error("Transaction has no operations")]
    EmptyTransaction,

    #[error("Rollback is disabled for this transaction")]
    RollbackDisabled,

    #[error("Cannot {op} a transaction in state {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("File was opened read-only")]
    ReadOnly,

    #[error("Range of {len} bytes at offset {offset} is past the largest file offset")]
    OutOfRange { offset: u64, len: u64 },

    // -------------------------------------------------------------------------
    // Commit Window Errors
    // -------------------------------------------------------------------------
    /// The log entry could not be made durable; the target was not touched.
    #[error("Failed to write log entry {id}: {source}")]
    JournalWrite {
        id: u32,
        #[source]
        source: std::io::Error,
    },

    /// The entry is durable but applying it failed; recovery will replay it.
    #[error("Failed to apply transaction {id} to the target file: {source}")]
    Apply {
        id: u32,
        #[source]
        source: std::io::Error,
    },

    /// The transaction is applied and durable; only its bookkeeping is stale.
    #[error("Failed to retire transaction {id}: {source}")]
    Retire {
        id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Journal at {} is marked broken, run recovery first", .0.display())]
    JournalBroken(PathBuf),

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Log entry decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Simulated crash at {0:?}")]
    SimulatedCrash(CrashPoint),

    // -------------------------------------------------------------------------
    // Scheduler / Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Autosync error: {0}")]
    Autosync(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl JournalError {
    /// Whether this error left a durable log entry that recovery must replay.
    pub fn needs_recovery(&self) -> bool {
        matches!(
            self,
            JournalError::Apply { .. }
                | JournalError::JournalBroken(_)
                | JournalError::SimulatedCrash(_)
        )
    }
}
