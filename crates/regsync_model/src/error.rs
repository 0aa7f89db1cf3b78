//! Error types for the model layer.

use crate::job::JobStatus;
use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while validating or decoding model values.
#[derive(Error, Debug)]
pub enum ModelError {
    /// A job status change the state machine does not allow.
    #[error("invalid job status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },

    /// A job configuration failed validation.
    #[error("invalid job conf: {0}")]
    InvalidJobConf(String),

    /// A request did not carry a required parameter.
    #[error("missing request parameter: {0}")]
    MissingParam(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
