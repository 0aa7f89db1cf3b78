//! Error types for the core server.

use regsync_engine::EngineError;
use regsync_model::{JobType, ModelError};
use regsync_sched::SchedError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while running jobs.
#[derive(Error, Debug)]
pub enum ServerError {
    /// No reader or writer is registered under the component name.
    #[error("no {kind} registered for component {name}")]
    MissingPlugin {
        /// `"reader"` or `"writer"`.
        kind: &'static str,
        /// Component name.
        name: String,
    },

    /// A job with this id is already tracked.
    #[error("job {0} already exists")]
    DuplicateJob(String),

    /// No job with this id is tracked.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// No executor handles this job family.
    #[error("no executor for job type {0}")]
    NoExecutor(JobType),

    /// Jobs can only be started from inside a tokio runtime.
    #[error("no tokio runtime to run job {0}")]
    NoRuntime(String),

    /// One or more jobs failed to close.
    #[error("close failed: {}", .0.join("; "))]
    CloseFailed(Vec<String>),

    /// Engine error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Scheduler error.
    #[error("scheduler error: {0}")]
    Sched(#[from] SchedError),

    /// Model error.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if the error comes from the job definition rather than
    /// from running it.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ServerError::MissingPlugin { .. }
                | ServerError::DuplicateJob(_)
                | ServerError::NoExecutor(_)
                | ServerError::Model(ModelError::InvalidJobConf(_))
        )
    }
}
