//! Crash injection
//!
//! A handle can be armed with one [`CrashPoint`]. When the commit engine
//! reaches that point it stops dead: no cleanup, no id release, locks and
//! file handles simply dropped. What is left on disk is what a process
//! killed at that instant would leave, which is what recovery must cope with.
//!
//! # Example
//!
//! ```ignore
//! use walfile::testing::CrashPoint;
//!
//! file.inject_crash(CrashPoint::AfterLogSync);
//! assert!(file.pwrite(b"data", 0).is_err());
//! // target untouched, entry durable: scan() reports it as reapplied
//! ```

use parking_lot::Mutex;

use crate::error::{JournalError, Result};

/// Points in the commit protocol where a crash can be simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Entry file created, nothing written
    AfterCreate,
    /// Header written
    AfterHeader,
    /// First operation (header and payload) written
    AfterFirstOp,
    /// All operations and the sentinel written, no trailer
    AfterOps,
    /// Entry complete and synced, target untouched
    AfterLogSync,
    /// First write applied to the target
    AfterFirstApply,
    /// All writes applied and the target synced
    AfterApply,
    /// Entry deleted, id not yet released
    BeforeRelease,
    /// Journal-sync fsynced the target but has not deleted lingering entries
    BeforeSyncUnlink,
}

impl CrashPoint {
    /// All crash points in protocol order
    pub fn all() -> Vec<CrashPoint> {
        vec![
            CrashPoint::AfterCreate,
            CrashPoint::AfterHeader,
            CrashPoint::AfterFirstOp,
            CrashPoint::AfterOps,
            CrashPoint::AfterLogSync,
            CrashPoint::AfterFirstApply,
            CrashPoint::AfterApply,
            CrashPoint::BeforeRelease,
            CrashPoint::BeforeSyncUnlink,
        ]
    }
}

/// One-shot crash trigger owned by a file handle
#[derive(Debug, Default)]
pub(crate) struct CrashInjector {
    armed: Mutex<Option<CrashPoint>>,
}

impl CrashInjector {
    pub(crate) fn arm(&self, point: CrashPoint) {
        *self.armed.lock() = Some(point);
    }

    pub(crate) fn disarm(&self) {
        *self.armed.lock() = None;
    }

    /// Fire if armed for `point`; the trigger disarms itself when it fires
    pub(crate) fn check(&self, point: CrashPoint) -> Result<()> {
        let mut armed = self.armed.lock();
        if *armed == Some(point) {
            *armed = None;
            tracing::warn!(?point, "simulated crash");
            return Err(JournalError::SimulatedCrash(point));
        }
        Ok(())
    }
}
