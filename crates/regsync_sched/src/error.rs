//! Error types for the scheduling primitives.

use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in the worker pool or the time wheel.
#[derive(Error, Debug)]
pub enum SchedError {
    /// The worker pool no longer accepts work.
    #[error("worker pool is closed")]
    PoolClosed,

    /// The worker pool queue is at capacity.
    #[error("worker pool queue is full")]
    PoolFull,

    /// The time wheel has been stopped.
    #[error("time wheel is stopped")]
    WheelStopped,

    /// The time wheel was already started.
    #[error("time wheel is already running")]
    AlreadyStarted,

    /// A configuration value is out of range.
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),

    /// Spawning an OS thread failed.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SchedError {
    /// Returns true if the scheduler refused the work because it is shutting down.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, SchedError::PoolClosed | SchedError::WheelStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_classification() {
        assert!(SchedError::PoolClosed.is_shutdown());
        assert!(SchedError::WheelStopped.is_shutdown());
        assert!(!SchedError::InvalidConfig("slots".into()).is_shutdown());
        assert!(!SchedError::PoolFull.is_shutdown());
    }

    #[test]
    fn error_display() {
        let err = SchedError::InvalidConfig("slots must be > 0".into());
        assert_eq!(err.to_string(), "invalid scheduler config: slots must be > 0");
    }
}
