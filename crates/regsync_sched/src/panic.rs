//! Panic isolation for scheduled work units.

use parking_lot::RwLock;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Callback invoked with the message of a recovered panic.
pub type PanicHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Shared, replaceable panic handler slot.
#[derive(Clone)]
pub(crate) struct PanicSlot {
    handler: Arc<RwLock<PanicHandler>>,
}

impl PanicSlot {
    pub(crate) fn new(component: &'static str) -> Self {
        let default: PanicHandler = Arc::new(move |message| {
            tracing::error!(component, panic = %message, "scheduled work panicked");
        });
        Self {
            handler: Arc::new(RwLock::new(default)),
        }
    }

    pub(crate) fn set(&self, handler: PanicHandler) {
        *self.handler.write() = handler;
    }

    /// Runs `work`, routing a panic to the installed handler.
    ///
    /// Returns false if the unit panicked.
    pub(crate) fn run_guarded<F: FnOnce()>(&self, work: F) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(()) => true,
            Err(payload) => {
                let handler = self.handler.read().clone();
                // A panicking handler must not take the worker down either.
                let message = payload_message(payload.as_ref());
                if panic::catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                    tracing::error!("panic handler panicked");
                }
                false
            }
        }
    }
}

/// Extracts a readable message from a panic payload.
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn guarded_run_reports_panic() {
        let slot = PanicSlot::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        slot.set(Arc::new(move |msg| sink.lock().push(msg)));

        assert!(slot.run_guarded(|| {}));
        assert!(!slot.run_guarded(|| panic!("boom")));
        assert_eq!(seen.lock().as_slice(), ["boom".to_string()]);
    }

    #[test]
    fn formatted_payload() {
        let slot = PanicSlot::new("test");
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        slot.set(Arc::new(move |msg| *sink.lock() = msg));

        slot.run_guarded(|| panic!("unit {} failed", 7));
        assert_eq!(*seen.lock(), "unit 7 failed");
    }
}
