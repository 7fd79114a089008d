//! Output byte accounting with soft and hard kill thresholds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::jail::ProcessHandle;

/// Counts bytes a session's children have emitted and signals the live
/// child when the totals cross the configured limits. One limiter spans
/// both steps of a run; the total never resets.
pub(crate) struct OutputLimiter {
    soft_limit: u64,
    hard_limit: u64,
    total: AtomicU64,
    child: Mutex<Weak<ProcessHandle>>,
}

impl OutputLimiter {
    pub(crate) fn new(soft_limit: u64, hard_limit: u64) -> Self {
        Self {
            soft_limit,
            hard_limit,
            total: AtomicU64::new(0),
            child: Mutex::new(Weak::new()),
        }
    }

    /// Point the limiter at the step's current child.
    pub(crate) fn attach(&self, handle: &Arc<ProcessHandle>) {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        *child = Arc::downgrade(handle);
    }

    /// Account `len` more emitted bytes and enforce the thresholds.
    pub(crate) fn add(&self, len: usize) {
        let previous = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                Some(total.saturating_add(len as u64))
            })
            .unwrap_or_else(|total| total);
        let total = previous.saturating_add(len as u64);
        if let Some(signo) = breach(total, self.soft_limit, self.hard_limit) {
            let child = self.child.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(child) = child.upgrade() {
                child.kill(signo);
            }
        }
    }

    pub(crate) fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }
}

/// The signal, if any, a running total has earned.
fn breach(total: u64, soft_limit: u64, hard_limit: u64) -> Option<libc::c_int> {
    if total >= hard_limit {
        Some(libc::SIGKILL)
    } else if total >= soft_limit {
        Some(libc::SIGXFSZ)
    } else {
        None
    }
}
