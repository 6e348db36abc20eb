//! # walfile
//!
//! Transactional, crash-consistent writes to ordinary files:
//! - Per-file write-ahead journal, one checksummed log entry per transaction
//! - Atomic multi-write transactions with read-your-own-writes reads
//! - Rollback through captured undo pre-images
//! - Offline recovery scan that replays or discards leftover entries
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  JournaledFile / Transaction                 │
//! │          (pread/pwrite façade, add_write, add_read)          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                      Commit Engine                           │
//! │          (log → apply → retire, undo capture)                │
//! └──────┬──────────────┬──────────────────────┬────────────────┘
//!        │              │                      │
//!        ▼              ▼                      ▼
//!  ┌───────────┐  ┌─────────────┐      ┌──────────────┐
//!  │ Registry  │  │ Log entries │      │ Target file  │
//!  │  (lock)   │  │  (1, 2, …)  │      │              │
//!  └───────────┘  └──────┬──────┘      └──────▲───────┘
//!                        │                    │
//!                        └──── Scanner ───────┘
//!                        (classify / replay)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use walfile::{Config, JournaledFile};
//!
//! # fn main() -> walfile::Result<()> {
//! let file = JournaledFile::open("data.bin", Config::default())?;
//!
//! let mut tx = file.new_transaction();
//! tx.add_write(0, b"header".to_vec())?;
//! tx.add_write(4096, b"record".to_vec())?;
//! let slot = tx.add_read(0, 6)?;
//! tx.commit()?;
//! assert_eq!(tx.read(slot), Some(&b"header"[..]));
//!
//! tx.rollback()?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod file;
pub mod journal;
pub mod testing;
pub mod transaction;

mod autosync;
mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{AutosyncConfig, Config, RetirePolicy};
pub use error::{JournalError, Result};
pub use file::JournaledFile;
pub use journal::{scan, FsckReport, Scanner};
pub use transaction::{ReadSlot, Transaction, TxState};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of walfile
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
