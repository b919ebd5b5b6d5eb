use thiserror::Error;

/// Errors surfaced by the task execution core.
///
/// A single crate-wide error enum: driver failures, caller precondition
/// violations, and internal invariant violations all funnel through one
/// type so callers match on `TaskError` rather than threading several
/// error types through the orchestration layer.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("driver failed: {0}")]
    DriverFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown source id: {0}")]
    UnknownSource(String),

    #[error("output buffer closed: {0}")]
    BufferClosed(String),

    #[error("timeout waiting for {0}")]
    Timeout(String),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Clone for TaskError {
    fn clone(&self) -> Self {
        match self {
            TaskError::DriverFailed(s) => TaskError::DriverFailed(s.clone()),
            TaskError::InvalidArgument(s) => TaskError::InvalidArgument(s.clone()),
            TaskError::UnknownSource(s) => TaskError::UnknownSource(s.clone()),
            TaskError::BufferClosed(s) => TaskError::BufferClosed(s.clone()),
            TaskError::Timeout(s) => TaskError::Timeout(s.clone()),
            TaskError::InvalidState(s) => TaskError::InvalidState(s.clone()),
            TaskError::Internal(s) => TaskError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
