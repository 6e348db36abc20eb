//! Autosync Scheduler
//!
//! A background thread that retires lingering entries of one handle, either
//! every `interval` or as soon as `max_pending` entries have accumulated,
//! whichever comes first.
//!
//! ```text
//!   commit ──push──► lingering list ──len ≥ max_pending──► Wake ─┐
//!                                                                ▼
//!                         recv_timeout(interval) ──► engine.sync()
//! ```
//!
//! The thread only holds a weak reference to the engine; a tick is the same
//! journal sync a caller can run by hand and shares its lock.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::config::AutosyncConfig;
use crate::engine::Engine;
use crate::error::{JournalError, Result};

/// Messages from the handle to the scheduler thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Enough entries are lingering, sync now
    Wake,
    /// Exit the loop
    Stop,
}

/// Engine-side half: wakes the scheduler early
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    sender: Sender<Signal>,
    max_pending: usize,
}

impl Notifier {
    pub(crate) fn notify(&self, pending: usize) {
        if pending >= self.max_pending {
            // A full or closed channel only means a sync is already due
            let _ = self.sender.try_send(Signal::Wake);
        }
    }
}

/// A running scheduler thread
pub(crate) struct Autosync {
    sender: Sender<Signal>,
    handle: JoinHandle<u64>,
    engine: Weak<Engine>,
}

impl Autosync {
    /// Spawn the scheduler for `engine`
    pub(crate) fn start(engine: &Arc<Engine>, config: AutosyncConfig) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = channel::bounded(1);
        let weak = Arc::downgrade(engine);
        let thread_engine = weak.clone();

        let handle = thread::Builder::new()
            .name("walfile-autosync".to_string())
            .spawn(move || {
                let mut failures = 0u64;
                loop {
                    match receiver.recv_timeout(config.interval) {
                        Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
                    }

                    let Some(engine) = thread_engine.upgrade() else {
                        break;
                    };
                    if engine.pending() == 0 {
                        continue;
                    }
                    match engine.sync() {
                        Ok(retired) => debug!(retired, "autosync tick"),
                        Err(e) => {
                            failures += 1;
                            warn!(error = %e, "autosync failed to retire entries");
                        }
                    }
                }
                failures
            })
            .map_err(|e| JournalError::Autosync(format!("failed to spawn thread: {}", e)))?;

        engine.set_notifier(Some(Notifier {
            sender: sender.clone(),
            max_pending: config.max_pending,
        }));
        debug!(
            max_pending = config.max_pending,
            interval_ms = config.interval.as_millis() as u64,
            "autosync started"
        );

        Ok(Self {
            sender,
            handle,
            engine: weak,
        })
    }

    /// Stop the thread and wait for it.
    ///
    /// Reports an error if any tick failed while the scheduler ran.
    pub(crate) fn stop(self) -> Result<()> {
        if let Some(engine) = self.engine.upgrade() {
            engine.set_notifier(None);
        }

        // Blocks while a Wake is queued; the thread drains it before exiting
        let _ = self.sender.send(Signal::Stop);
        let failures = self
            .handle
            .join()
            .map_err(|_| JournalError::Autosync("scheduler thread panicked".to_string()))?;

        debug!(failures, "autosync stopped");
        if failures > 0 {
            return Err(JournalError::Autosync(format!(
                "{} sync pass(es) failed",
                failures
            )));
        }
        Ok(())
    }
}
