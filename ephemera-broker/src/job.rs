//! Job registration types.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use ephemera_models::errors::SendableError;
use tokio_util::sync::CancellationToken;

/// Closed set of job identifiers served by one queue, usually a fieldless enum.
///
/// `as_str` is the name persisted with each task and must be unique per queue.
pub trait JobKey: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    fn as_str(&self) -> &'static str;
}

/// A unit of work handed to a job handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task<J> {
    pub job: J,
    pub task_id: String,
    pub payload: Vec<u8>,
}

/// A task submitted through [`crate::Queue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask<J> {
    pub job: J,
    /// Generated by the queue when absent.
    pub task_id: Option<String>,
    pub payload: Vec<u8>,
    /// Overrides the job's priority when present.
    pub priority: Option<i64>,
}

impl<J: JobKey> NewTask<J> {
    pub fn new(job: J, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            job,
            task_id: None,
            payload: payload.into(),
            priority: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[async_trait]
pub trait JobHandler<J: JobKey>: Send + Sync + 'static {
    /// Handlers should watch `ctx` for long-running work; the consumer never
    /// interrupts a running handler.
    async fn handle(&self, ctx: CancellationToken, task: Task<J>) -> Result<(), SendableError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn(f)
}

#[async_trait]
impl<J, F, Fut> JobHandler<J> for HandlerFn<F>
where
    J: JobKey,
    F: Fn(CancellationToken, Task<J>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SendableError>> + Send + 'static,
{
    async fn handle(&self, ctx: CancellationToken, task: Task<J>) -> Result<(), SendableError> {
        (self.0)(ctx, task).await
    }
}

/// Registration entry: identifier, priority (higher is served first) and handler.
pub struct Job<J: JobKey> {
    pub id: J,
    pub priority: i64,
    handler: Option<Arc<dyn JobHandler<J>>>,
}

impl<J: JobKey> Job<J> {
    pub fn new(id: J, priority: i64) -> Self {
        Self {
            id,
            priority,
            handler: None,
        }
    }

    pub fn with_handler<H>(mut self, handler: H) -> Self
    where
        H: JobHandler<J>,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_shared_handler(mut self, handler: Arc<dyn JobHandler<J>>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub(crate) fn into_parts(self) -> (J, i64, Option<Arc<dyn JobHandler<J>>>) {
        (self.id, self.priority, self.handler)
    }
}

impl<J: JobKey> fmt::Debug for Job<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}
