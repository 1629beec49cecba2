use std::error::Error as StdError;
use std::time::Duration;

use ephemera_models::errors::SendableError;
use thiserror::Error;

/// Result alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// A queue was built without a backend.
    #[error("queue backend is required")]
    MissingBackend,

    #[error("duplicate job id: {0}")]
    DuplicateJob(&'static str),

    #[error("job has nil handler: {0}")]
    MissingHandler(&'static str),

    /// Queue names become table names and must match `[A-Za-z_][A-Za-z0-9_]*`.
    #[error("invalid queue name '{0}'")]
    InvalidQueueName(String),

    #[error("task id generator returned an empty id")]
    EmptyTaskId,

    #[error("unknown job id: {0}")]
    UnknownJob(String),

    #[error("unknown task id: {0}")]
    UnknownTask(String),

    #[error("duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("retries exceeded for task {0}")]
    RetriesExceeded(String),

    #[error("operation cancelled")]
    Cancelled,

    /// A job handler returned an error (or panicked) while processing a task.
    /// `exhausted` is set when the failure moved the task to its terminal state.
    #[error("job handler failed for task {task_id}: {source}")]
    Handler {
        task_id: String,
        exhausted: bool,
        #[source]
        source: SendableError,
    },

    #[error("queue storage error: {0}")]
    Storage(#[source] SendableError),

    /// The consumer's error hook asked for the worker pool to stop.
    #[error("consumer stopped by error hook: {0}")]
    Escalated(#[source] SendableError),

    #[error("consumer did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

impl QueueError {
    pub fn storage<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        QueueError::Storage(Box::new(error))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueueError::Cancelled)
    }

    pub fn is_retries_exceeded(&self) -> bool {
        matches!(self, QueueError::RetriesExceeded(_))
    }

    /// Configuration errors are raised at construction and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            QueueError::MissingBackend
                | QueueError::DuplicateJob(_)
                | QueueError::MissingHandler(_)
                | QueueError::InvalidQueueName(_)
                | QueueError::EmptyTaskId
        )
    }
}
