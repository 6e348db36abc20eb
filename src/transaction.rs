//! Transactions
//!
//! A transaction is an ordered list of writes and reads against one
//! journaled file. Nothing touches the disk until `commit()`; the engine then
//! logs the writes, applies them, and fills every read with what the file
//! would contain at that point of the sequence.
//!
//! ## State Machine
//! ```text
//!   Building ──commit──► Committed ──rollback──► RolledBack
//!      │
//!      └──commit (no undo capture)──► Retired
//! ```
//! A failed commit leaves the transaction in `Building`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::engine::{CommitOptions, Engine, UndoLog};
use crate::error::{JournalError, Result};
use crate::journal::{range_end, LogOp, FLAG_NO_ROLLBACK, FLAG_ROLLBACK};

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Operations may be added
    Building,
    /// Applied and durable; undo data is available
    Committed,
    /// Undone by a successful rollback
    RolledBack,
    /// Applied and durable; committed without undo data
    Retired,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Building => "building",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled-back",
            TxState::Retired => "retired",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single operation in a transaction
#[derive(Debug, Clone)]
pub(crate) enum TxOp {
    /// Logged write
    Write(LogOp),
    /// Unlogged read, filled at commit time
    Read { offset: u64, len: usize },
}

/// Handle to the buffer of a read operation, valid after commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSlot(usize);

/// A group of writes (and reads) applied atomically to one file
pub struct Transaction {
    /// Engine of the file this transaction belongs to
    engine: Arc<Engine>,
    /// Operations in the order they were added
    ops: Vec<TxOp>,
    /// Current lifecycle state
    state: TxState,
    /// Id the commit ran under (allocated lazily at commit)
    id: Option<u32>,
    /// Whether undo pre-images are captured at commit
    capture_undo: bool,
    /// Read buffers, indexed by ReadSlot
    reads: Vec<Option<Vec<u8>>>,
    /// Pre-images captured during commit
    undo: Option<UndoLog>,
    /// Payload bytes queued for writing
    write_len: usize,
}

impl Transaction {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        let capture_undo = engine.config().undo;
        Self {
            engine,
            ops: Vec::new(),
            state: TxState::Building,
            id: None,
            capture_undo,
            reads: Vec::new(),
            undo: None,
            write_len: 0,
        }
    }

    // =========================================================================
    // Building
    // =========================================================================

    /// Queue a write of `data` at `offset`.
    ///
    /// Zero-length writes are rejected, as are writes larger than `u32::MAX`
    /// bytes or ending past [`MAX_OFFSET`](crate::journal::MAX_OFFSET).
    pub fn add_write(&mut self, offset: u64, data: impl Into<Bytes>) -> Result<()> {
        self.expect_state(TxState::Building, "add a write to")?;

        let data = data.into();
        if data.is_empty() {
            return Err(JournalError::ZeroLengthWrite);
        }
        let len = data.len() as u64;
        if len > u32::MAX as u64 || range_end(offset, len).is_none() {
            return Err(JournalError::OutOfRange { offset, len });
        }

        self.write_len += data.len();
        self.ops.push(TxOp::Write(LogOp::new(offset, data)));
        Ok(())
    }

    /// Queue a read of `len` bytes at `offset`.
    ///
    /// The read sees every write added before it in this transaction, and
    /// the file's current content elsewhere. Its buffer is available through
    /// [`Transaction::read`] once the transaction is committed.
    pub fn add_read(&mut self, offset: u64, len: usize) -> Result<ReadSlot> {
        self.expect_state(TxState::Building, "add a read to")?;
        if range_end(offset, len as u64).is_none() {
            return Err(JournalError::OutOfRange {
                offset,
                len: len as u64,
            });
        }

        let slot = ReadSlot(self.reads.len());
        self.reads.push(None);
        self.ops.push(TxOp::Read { offset, len });
        Ok(slot)
    }

    // =========================================================================
    // Commit / Rollback
    // =========================================================================

    /// Commit the transaction.
    ///
    /// Returns the number of payload bytes written to the file.
    pub fn commit(&mut self) -> Result<usize> {
        self.expect_state(TxState::Building, "commit")?;
        if self.ops.is_empty() {
            return Err(JournalError::EmptyTransaction);
        }

        let mut flags = 0;
        if !self.capture_undo {
            flags |= FLAG_NO_ROLLBACK;
        }

        let outcome = self.engine.commit(
            &self.ops,
            CommitOptions {
                flags,
                capture_undo: self.capture_undo,
            },
        )?;

        for (slot, buf) in self.reads.iter_mut().zip(outcome.reads) {
            *slot = Some(buf);
        }
        self.id = outcome.id;
        self.undo = outcome.undo;
        self.state = if self.capture_undo {
            TxState::Committed
        } else {
            TxState::Retired
        };

        debug!(id = ?self.id, written = outcome.written, state = %self.state, "transaction committed");
        Ok(outcome.written)
    }

    /// Undo a committed transaction.
    ///
    /// The captured pre-images are committed as a new transaction through
    /// the same protocol, so a rollback is itself crash-safe. Returns the
    /// number of bytes restored.
    pub fn rollback(&mut self) -> Result<usize> {
        match self.state {
            TxState::Committed => {}
            TxState::Retired => return Err(JournalError::RollbackDisabled),
            _ if !self.capture_undo => return Err(JournalError::RollbackDisabled),
            state => {
                return Err(JournalError::InvalidState {
                    op: "roll back",
                    state: state.as_str(),
                })
            }
        }

        let restored = match &self.undo {
            Some(undo) => {
                // Reverse order so overlapping writes unwind innermost first
                let ops: Vec<TxOp> = undo
                    .images
                    .iter()
                    .rev()
                    .filter(|image| !image.data.is_empty())
                    .map(|image| TxOp::Write(LogOp::new(image.offset, image.data.clone())))
                    .collect();

                let mut restored = 0;
                if !ops.is_empty() {
                    let outcome = self.engine.commit(
                        &ops,
                        CommitOptions {
                            flags: FLAG_ROLLBACK | FLAG_NO_ROLLBACK,
                            capture_undo: false,
                        },
                    )?;
                    restored = outcome.written;
                }

                if undo.grew_file() {
                    self.engine.truncate(undo.original_len)?;
                }
                restored
            }
            None => 0,
        };

        self.state = TxState::RolledBack;
        self.undo = None;
        debug!(id = ?self.id, restored, "transaction rolled back");
        Ok(restored)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Buffer filled by a read operation (after a successful commit)
    pub fn read(&self, slot: ReadSlot) -> Option<&[u8]> {
        self.reads.get(slot.0)?.as_deref()
    }

    /// Current state
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Id the transaction committed under, if any
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Number of queued operations (reads and writes)
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Payload bytes queued for writing
    pub fn write_len(&self) -> usize {
        self.write_len
    }

    /// Whether rollback data will be (or was) captured
    pub fn captures_undo(&self) -> bool {
        self.capture_undo
    }

    fn expect_state(&self, expected: TxState, op: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(JournalError::InvalidState {
                op,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("ops", &self.ops.len())
            .field("write_len", &self.write_len)
            .finish()
    }
}

// =============================================================================
// Read Composition
// =============================================================================

/// Compose what a read of `len` bytes at `offset` returns after `earlier`
/// writes are applied to a file of `file_len` bytes whose content at
/// `offset` is `base` (zero-padded to `len`).
///
/// The result is truncated at the end of the file as it would be after
/// those writes, exactly like a short `pread`.
///
/// Every range here was bounded by `add_read`/`add_write`, so no end
/// position exceeds `MAX_OFFSET` and the sums below cannot overflow.
pub(crate) fn compose_read(
    mut base: Vec<u8>,
    file_len: u64,
    offset: u64,
    len: usize,
    earlier: &[&LogOp],
) -> Vec<u8> {
    base.resize(len, 0);

    let mut end_of_file = file_len;
    let read_end = offset + len as u64;

    for op in earlier {
        let op_end = op.offset + op.data.len() as u64;
        end_of_file = end_of_file.max(op_end);

        let start = op.offset.max(offset);
        let stop = op_end.min(read_end);
        if start >= stop {
            continue;
        }

        let dst = (start - offset) as usize..(stop - offset) as usize;
        let src = (start - op.offset) as usize..(stop - op.offset) as usize;
        base[dst].copy_from_slice(&op.data[src]);
    }

    let visible = end_of_file.saturating_sub(offset).min(len as u64) as usize;
    base.truncate(visible);
    base
}
