//! Cancellation handles for scheduled work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A handle to a submitted or scheduled unit of work.
///
/// Cancellation is lazy: it records a flag that the scheduler checks at fixed
/// points (before a pool worker runs the unit, before a wheel consumer runs a
/// popped task, before a repeating task is re-armed). A unit already running
/// is never interrupted, and a wheel task already handed to its bucket
/// consumer may still run once.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Creates a handle that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that no further executions be scheduled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_flag() {
        let handle = CancelHandle::new();
        let other = handle.clone();
        assert!(!other.is_cancelled());

        handle.cancel();
        assert!(other.is_cancelled());
    }
}
