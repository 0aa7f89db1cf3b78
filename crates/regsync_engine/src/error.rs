//! Error types for the sync engine.

use regsync_model::{Action, ModelError};
use regsync_sched::SchedError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while reconciling or watching.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No conversion is registered for a `source=>target` pair.
    #[error("no transformer registered for {key}")]
    NoTransformer {
        /// The `source=>target` key.
        key: String,
    },

    /// A required collaborator could not be resolved.
    #[error("missing collaborator: {0}")]
    MissingCollaborator(String),

    /// A reader returned a result of the wrong shape.
    #[error("unexpected read result: expected {expected}, got {actual}")]
    UnexpectedResult {
        /// Expected shape.
        expected: &'static str,
        /// Actual shape.
        actual: &'static str,
    },

    /// The source reader failed.
    #[error("reader {name} failed: {message}")]
    Reader {
        /// Reader name.
        name: String,
        /// Error message.
        message: String,
    },

    /// The destination writer failed.
    #[error("writer {name} failed: {message}")]
    Writer {
        /// Writer name.
        name: String,
        /// Error message.
        message: String,
    },

    /// The destination writer did not accept a request.
    #[error("writer {name} rejected {action}")]
    Rejected {
        /// Writer name.
        name: String,
        /// Rejected action.
        action: Action,
    },

    /// A transformer failed to convert an object.
    #[error("transform {key} failed: {message}")]
    Transform {
        /// The `source=>target` key.
        key: String,
        /// Error message.
        message: String,
    },

    /// A collaborator does not handle an action.
    #[error("{name} does not support {action}")]
    Unsupported {
        /// Collaborator name.
        name: String,
        /// Requested action.
        action: Action,
    },

    /// A plugin option has an unusable value.
    #[error("invalid option {key}={value}")]
    InvalidOption {
        /// Option key.
        key: String,
        /// Option value.
        value: String,
    },

    /// The job was cancelled while the operation was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// The sink was run before `init`.
    #[error("sink not initialized")]
    NotInitialized,

    /// Model error.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Scheduler error.
    #[error(transparent)]
    Sched(#[from] SchedError),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Creates a reader error.
    pub fn reader(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Reader {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a writer error.
    pub fn writer(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Writer {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error came from a reader, writer or transformer.
    ///
    /// These are recovered at the tick or event boundary; the next tick
    /// retries.
    pub fn is_collaborator_error(&self) -> bool {
        matches!(
            self,
            EngineError::Reader { .. }
                | EngineError::Writer { .. }
                | EngineError::Rejected { .. }
                | EngineError::Transform { .. }
                | EngineError::UnexpectedResult { .. }
                | EngineError::Unsupported { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaborator_classification() {
        assert!(EngineError::reader("memory", "down").is_collaborator_error());
        assert!(EngineError::writer("memory", "down").is_collaborator_error());
        assert!(!EngineError::Cancelled.is_collaborator_error());
        assert!(!EngineError::NoTransformer {
            key: "a=>b".into()
        }
        .is_collaborator_error());
    }

    #[test]
    fn error_display() {
        let err = EngineError::NoTransformer {
            key: "nacos=>polarismesh".into(),
        };
        assert_eq!(
            err.to_string(),
            "no transformer registered for nacos=>polarismesh"
        );

        let err = EngineError::Rejected {
            name: "memory".into(),
            action: Action::CreateInstances,
        };
        assert_eq!(err.to_string(), "writer memory rejected create_instances");
    }
}
