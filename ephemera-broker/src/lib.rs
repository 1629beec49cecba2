pub mod backoff;
pub mod batch;
pub mod consumer;
mod errors;
pub mod in_memory;
pub mod job;
pub mod queue;
pub mod sequence;
mod types;

pub use backoff::{Backoff, RetryDelay, RetryPolicy};
pub use batch::BatchPolicy;
pub use consumer::{Consumer, ConsumerHandle, ErrorHook};
pub use errors::{QueueError, Result};
pub use job::{handler_fn, Job, JobHandler, JobKey, NewTask, Task};
pub use queue::{Queue, QueueBuilder};
pub use sequence::{CounterGenerator, TaskIdGenerator, UuidGenerator};
pub use types::{Delivery, QueueEntry};

pub use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

/// Storage and delivery engine behind a [`Queue`].
///
/// Implementations own all synchronization: any number of workers may call
/// `dequeue` concurrently with producers calling `enqueue`, and a task is only
/// ever in flight for one caller at a time.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Persist or buffer a task. Buffered tasks become visible on flush.
    async fn enqueue(&self, ctx: &CancellationToken, entry: QueueEntry) -> Result<()>;

    /// Wait for and claim the highest-priority eligible task, oldest first
    /// among equal priorities. Returns [`QueueError::Cancelled`] once `ctx` is.
    async fn dequeue(&self, ctx: &CancellationToken) -> Result<Delivery>;

    /// Mark an in-flight task as done.
    async fn ack(&self, ctx: &CancellationToken, task_id: &str) -> Result<()>;

    /// Report a failed attempt. Returns [`QueueError::RetriesExceeded`] when the
    /// task moved to its terminal failed state instead of being retried.
    async fn nack(&self, ctx: &CancellationToken, task_id: &str) -> Result<()>;

    /// Materialize any buffered batch immediately.
    async fn force_flush(&self, ctx: &CancellationToken) -> Result<()>;

    /// Release resources held by the backend.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<B> Backend for std::sync::Arc<B>
where
    B: Backend + ?Sized,
{
    async fn enqueue(&self, ctx: &CancellationToken, entry: QueueEntry) -> Result<()> {
        (**self).enqueue(ctx, entry).await
    }

    async fn dequeue(&self, ctx: &CancellationToken) -> Result<Delivery> {
        (**self).dequeue(ctx).await
    }

    async fn ack(&self, ctx: &CancellationToken, task_id: &str) -> Result<()> {
        (**self).ack(ctx, task_id).await
    }

    async fn nack(&self, ctx: &CancellationToken, task_id: &str) -> Result<()> {
        (**self).nack(ctx, task_id).await
    }

    async fn force_flush(&self, ctx: &CancellationToken) -> Result<()> {
        (**self).force_flush(ctx).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}
