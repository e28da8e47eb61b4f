//! Task monitoring for long running memory operations.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;

/// A cancellation and progress hook consulted by long running operations.
///
/// Block creation from a byte stream and byte-pattern searches check the
/// monitor periodically; a cancelled monitor aborts the operation with
/// `Error::Cancelled` before any partial result is committed.
pub trait TaskMonitor: Send + Sync {
    fn is_cancelled(&self) -> bool;

    fn increment_progress(&self, _amount: u64) {}

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A monitor which is never cancelled and discards progress.
pub struct NullMonitor;

impl TaskMonitor for NullMonitor {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A monitor which can be cancelled from another thread.
#[derive(Default)]
pub struct CancelMonitor {
    cancelled: AtomicBool,
}

impl CancelMonitor {
    pub fn new() -> CancelMonitor {
        CancelMonitor::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl TaskMonitor for CancelMonitor {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
