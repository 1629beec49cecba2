//! Worker pool that drains a [`Queue`] and settles every task it claims.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use ephemera_models::errors::{RuntimeError, SendableError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::job::{JobKey, Task};
use crate::queue::Queue;
use crate::{Delivery, QueueError, Result};

/// Called for every asynchronous failure a worker observes. Returning an error
/// stops the whole consumer and becomes the result of [`Consumer::run`].
pub type ErrorHook = Arc<
    dyn Fn(&QueueError, Option<&Delivery>) -> std::result::Result<(), SendableError>
        + Send
        + Sync,
>;

const DEFAULT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Default hook: logs and never escalates.
pub fn log_error(
    err: &QueueError,
    delivery: Option<&Delivery>,
) -> std::result::Result<(), SendableError> {
    let task_id = delivery.map(|d| d.task_id.as_str()).unwrap_or("-");
    match err {
        QueueError::Handler {
            exhausted: false, ..
        } => warn!("{} (task {})", err, task_id),
        _ => error!("{} (task {})", err, task_id),
    }
    Ok(())
}

pub struct Consumer<J: JobKey> {
    queue: Arc<Queue<J>>,
    workers: usize,
    on_error: ErrorHook,
    error_pause: Duration,
}

impl<J: JobKey> Consumer<J> {
    pub fn new(queue: Arc<Queue<J>>) -> Self {
        Self {
            queue,
            workers: 1,
            on_error: Arc::new(log_error),
            error_pause: DEFAULT_ERROR_PAUSE,
        }
    }

    /// Zero is treated as one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&QueueError, Option<&Delivery>) -> std::result::Result<(), SendableError>
            + Send
            + Sync
            + 'static,
    {
        self.on_error = Arc::new(hook);
        self
    }

    /// Pause after a failed dequeue before the worker tries again.
    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs the pool until `ctx` is cancelled or the error hook escalates.
    /// Running handlers are awaited before this returns.
    pub async fn run(&self, ctx: &CancellationToken) -> Result<()> {
        self.run_scoped(ctx.child_token()).await
    }

    /// Runs the pool in the background. The returned handle owns the pool's scope.
    pub fn start(self, ctx: &CancellationToken) -> ConsumerHandle {
        let scope = ctx.child_token();
        let task = {
            let scope = scope.clone();
            tokio::spawn(async move { self.run_scoped(scope).await })
        };
        ConsumerHandle { scope, task }
    }

    async fn run_scoped(&self, scope: CancellationToken) -> Result<()> {
        let escalation = Arc::new(Mutex::new(None));
        let mut pool = JoinSet::new();

        info!("Starting consumer with {} worker(s)", self.workers);
        for index in 0..self.workers {
            let worker = Worker {
                index,
                queue: self.queue.clone(),
                on_error: self.on_error.clone(),
                error_pause: self.error_pause,
                scope: scope.clone(),
                escalation: escalation.clone(),
            };
            pool.spawn(worker.run());
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                error!("Consumer worker terminated abnormally: {}", err);
            }
        }
        scope.cancel();

        let escalated = escalation.lock().take();
        match escalated {
            Some(err) => {
                error!("Consumer stopped by error hook: {}", err);
                Err(QueueError::Escalated(err))
            }
            None => {
                info!("Consumer stopped");
                Ok(())
            }
        }
    }
}

/// Handle to a consumer started with [`Consumer::start`].
pub struct ConsumerHandle {
    scope: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    /// Stops new dequeues; running handlers finish on their own.
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the consumer to stop and returns its terminal result.
    pub async fn join(self) -> Result<()> {
        flatten(self.task.await)
    }

    /// Cancels the consumer and waits up to `timeout` for running handlers.
    /// On timeout the pool is aborted and its in-flight tasks stay in flight.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<()> {
        self.scope.cancel();
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                self.task.abort();
                warn!("Consumer did not stop within {:?}, aborting", timeout);
                Err(QueueError::ShutdownTimeout(timeout))
            }
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(QueueError::Escalated(Box::new(err))),
    }
}

struct Worker<J: JobKey> {
    index: usize,
    queue: Arc<Queue<J>>,
    on_error: ErrorHook,
    error_pause: Duration,
    scope: CancellationToken,
    escalation: Arc<Mutex<Option<SendableError>>>,
}

impl<J: JobKey> Worker<J> {
    async fn run(self) {
        debug!("Worker {} started", self.index);
        loop {
            let delivery = match self.queue.backend().dequeue(&self.scope).await {
                Ok(delivery) => delivery,
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    if !self.report(&err, None) {
                        break;
                    }
                    self.pause().await;
                    continue;
                }
            };

            if !self.process(delivery).await {
                break;
            }
        }
        debug!("Worker {} stopped", self.index);
    }

    /// Returns false when the hook escalated and the worker must stop.
    async fn process(&self, delivery: Delivery) -> bool {
        let backend = self.queue.backend();

        let target = self
            .queue
            .resolve(&delivery.job_id)
            .and_then(|job| self.queue.handler(job).map(|handler| (job, handler)));
        let Some((job, handler)) = target else {
            let mut keep_going =
                self.report(&QueueError::UnknownJob(delivery.job_id.clone()), Some(&delivery));
            if let Err(err) = backend.ack(&self.scope, &delivery.task_id).await {
                keep_going &= self.report(&err, Some(&delivery));
            }
            return keep_going;
        };

        let task = Task {
            job,
            task_id: delivery.task_id.clone(),
            payload: delivery.payload.clone(),
        };
        let ctx = self.scope.clone();
        let outcome = match tokio::spawn(async move { handler.handle(ctx, task).await }).await {
            Ok(outcome) => outcome,
            Err(err) => Err(panic_error(err)),
        };

        match outcome {
            Ok(()) => match backend.ack(&self.scope, &delivery.task_id).await {
                Ok(()) => {
                    debug!("Task {} completed", delivery.task_id);
                    true
                }
                Err(err) => self.report(&err, Some(&delivery)),
            },
            Err(source) => {
                let reported = match backend.nack(&self.scope, &delivery.task_id).await {
                    Ok(()) => QueueError::Handler {
                        task_id: delivery.task_id.clone(),
                        exhausted: false,
                        source,
                    },
                    Err(err) if err.is_retries_exceeded() => QueueError::Handler {
                        task_id: delivery.task_id.clone(),
                        exhausted: true,
                        source,
                    },
                    Err(err) => err,
                };
                self.report(&reported, Some(&delivery))
            }
        }
    }

    fn report(&self, err: &QueueError, delivery: Option<&Delivery>) -> bool {
        match (self.on_error)(err, delivery) {
            Ok(()) => true,
            Err(escalated) => {
                let mut slot = self.escalation.lock();
                if slot.is_none() {
                    *slot = Some(escalated);
                }
                drop(slot);
                self.scope.cancel();
                false
            }
        }
    }

    async fn pause(&self) {
        tokio::select! {
            _ = self.scope.cancelled() => {}
            _ = tokio::time::sleep(self.error_pause) => {}
        }
    }
}

fn panic_error(err: JoinError) -> SendableError {
    if !err.is_panic() {
        return Box::new(err);
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    Box::new(RuntimeError::new("handler_panic", message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::{InMemoryBackend, InMemoryOptions};
    use crate::job::{handler_fn, Job, NewTask};
    use crate::{Backend, QueueEntry, RetryPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestJob {
        Echo,
    }

    impl JobKey for TestJob {
        fn as_str(&self) -> &'static str {
            "echo"
        }
    }

    fn retrying(max_retries: Option<u32>) -> InMemoryBackend {
        InMemoryBackend::with_options(InMemoryOptions {
            retry: RetryPolicy::new(max_retries),
            ..Default::default()
        })
    }

    fn failing_job() -> Job<TestJob> {
        Job::new(TestJob::Echo, 0).with_handler(handler_fn(
            |_ctx: CancellationToken, _task: Task<TestJob>| async move {
                Err::<(), SendableError>("boom".into())
            },
        ))
    }

    type Seen = Arc<Mutex<Vec<(String, Option<bool>)>>>;

    /// Records (error kind, exhausted flag) for every reported error.
    fn recording_hook(
        seen: Seen,
    ) -> impl Fn(&QueueError, Option<&Delivery>) -> std::result::Result<(), SendableError> {
        move |err, _delivery| {
            let entry = match err {
                QueueError::Handler { exhausted, .. } => ("handler".to_string(), Some(*exhausted)),
                other => (other.to_string(), None),
            };
            seen.lock().push(entry);
            Ok(())
        }
    }

    async fn wait_for(seen: &Seen, count: usize) {
        timeout(Duration::from_secs(2), async {
            while seen.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("hook was not called in time");
    }

    #[test]
    fn zero_workers_means_one() {
        let queue = Queue::builder()
            .backend(InMemoryBackend::new())
            .job(failing_job())
            .build()
            .unwrap();
        let consumer = Consumer::new(Arc::new(queue)).with_workers(0);
        assert_eq!(consumer.workers(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn processes_and_acks_every_task() {
        let backend = InMemoryBackend::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = Job::new(TestJob::Echo, 0).with_handler(handler_fn(
            move |_ctx: CancellationToken, task: Task<TestJob>| {
                let tx = tx.clone();
                async move {
                    tx.send(task.task_id).map_err(|e| Box::new(e) as SendableError)?;
                    Ok::<(), SendableError>(())
                }
            },
        ));
        let queue = Arc::new(
            Queue::builder()
                .backend(backend.clone())
                .job(job)
                .build()
                .unwrap(),
        );
        let ctx = CancellationToken::new();
        let handle = Consumer::new(queue.clone()).with_workers(4).start(&ctx);

        for _ in 0..50 {
            queue
                .enqueue(&ctx, NewTask::new(TestJob::Echo, Vec::new()))
                .await
                .unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 50 {
            let id = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("handler not called")
                .unwrap();
            received.push(id);
        }
        received.sort();
        received.dedup();
        assert_eq!(received.len(), 50);

        handle.shutdown(Duration::from_secs(2)).await.unwrap();
        assert_eq!(backend.pending_len(), 0);
        assert_eq!(backend.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn failing_handler_is_retried_until_exhausted() {
        let backend = retrying(Some(1));
        let queue = Arc::new(
            Queue::builder()
                .backend(backend.clone())
                .job(failing_job())
                .build()
                .unwrap(),
        );
        let seen: Seen = Arc::default();
        let ctx = CancellationToken::new();
        let handle = Consumer::new(queue.clone())
            .on_error(recording_hook(seen.clone()))
            .start(&ctx);

        queue
            .enqueue(&ctx, NewTask::new(TestJob::Echo, Vec::new()))
            .await
            .unwrap();
        wait_for(&seen, 2).await;

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
        let seen = seen.lock().clone();
        assert_eq!(
            seen,
            vec![
                ("handler".to_string(), Some(false)),
                ("handler".to_string(), Some(true)),
            ]
        );
        assert_eq!(backend.pending_len(), 0);
        assert_eq!(backend.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn panicking_handler_is_reported_and_worker_survives() {
        let backend = retrying(Some(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let job = {
            let calls = calls.clone();
            Job::new(TestJob::Echo, 0).with_handler(handler_fn(
                move |_ctx: CancellationToken, task: Task<TestJob>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if task.payload == b"panic" {
                            panic!("handler exploded");
                        }
                        Ok::<(), SendableError>(())
                    }
                },
            ))
        };
        let queue = Arc::new(
            Queue::builder()
                .backend(backend.clone())
                .job(job)
                .build()
                .unwrap(),
        );
        let seen: Seen = Arc::default();
        let ctx = CancellationToken::new();
        let handle = Consumer::new(queue.clone())
            .on_error(recording_hook(seen.clone()))
            .start(&ctx);

        queue
            .enqueue(&ctx, NewTask::new(TestJob::Echo, b"panic".to_vec()))
            .await
            .unwrap();
        wait_for(&seen, 1).await;

        queue
            .enqueue(&ctx, NewTask::new(TestJob::Echo, b"fine".to_vec()))
            .await
            .unwrap();
        timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) < 2 || backend.in_flight_len() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(seen.lock().clone(), vec![("handler".to_string(), Some(true))]);
    }

    #[tokio::test]
    async fn unknown_job_is_reported_and_dropped() {
        let backend = InMemoryBackend::new();
        let queue = Arc::new(
            Queue::builder()
                .backend(backend.clone())
                .job(failing_job())
                .build()
                .unwrap(),
        );
        let seen: Seen = Arc::default();
        let ctx = CancellationToken::new();

        backend
            .enqueue(
                &ctx,
                QueueEntry {
                    job_id: "ghost".into(),
                    task_id: "stale".into(),
                    payload: Vec::new(),
                    priority: 0,
                },
            )
            .await
            .unwrap();

        let handle = Consumer::new(queue)
            .on_error(recording_hook(seen.clone()))
            .start(&ctx);
        wait_for(&seen, 1).await;
        handle.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(
            seen.lock().clone(),
            vec![("unknown job id: ghost".to_string(), None)]
        );
        assert_eq!(backend.pending_len(), 0);
        assert_eq!(backend.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn hook_error_stops_the_consumer() {
        let backend = retrying(None);
        let queue = Arc::new(
            Queue::builder()
                .backend(backend)
                .job(failing_job())
                .build()
                .unwrap(),
        );
        let ctx = CancellationToken::new();
        queue
            .enqueue(&ctx, NewTask::new(TestJob::Echo, Vec::new()))
            .await
            .unwrap();

        let consumer = Consumer::new(queue)
            .with_workers(3)
            .on_error(|_err, _delivery| Err("operator says stop".into()));

        let result = timeout(Duration::from_secs(2), consumer.run(&ctx))
            .await
            .expect("consumer should stop on escalation");
        match result {
            Err(QueueError::Escalated(err)) => assert_eq!(err.to_string(), "operator says stop"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn cancelling_parent_context_stops_cleanly() {
        let queue = Arc::new(
            Queue::builder()
                .backend(InMemoryBackend::new())
                .job(failing_job())
                .build()
                .unwrap(),
        );
        let ctx = CancellationToken::new();
        let handle = Consumer::new(queue).with_workers(2).start(&ctx);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        ctx.cancel();

        timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_times_out_on_stuck_handler() {
        let backend = InMemoryBackend::new();
        let job = Job::new(TestJob::Echo, 0).with_handler(handler_fn(
            |_ctx: CancellationToken, _task: Task<TestJob>| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<(), SendableError>(())
            },
        ));
        let queue = Arc::new(
            Queue::builder()
                .backend(backend.clone())
                .job(job)
                .build()
                .unwrap(),
        );
        let ctx = CancellationToken::new();
        let handle = Consumer::new(queue.clone()).start(&ctx);

        queue
            .enqueue(&ctx, NewTask::new(TestJob::Echo, Vec::new()))
            .await
            .unwrap();
        timeout(Duration::from_secs(1), async {
            while backend.in_flight_len() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let result = handle.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(QueueError::ShutdownTimeout(_))));
        assert_eq!(backend.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn nack_failure_replaces_handler_error() {
        struct RejectingNack(InMemoryBackend);

        #[async_trait::async_trait]
        impl Backend for RejectingNack {
            async fn enqueue(&self, ctx: &CancellationToken, entry: QueueEntry) -> Result<()> {
                self.0.enqueue(ctx, entry).await
            }
            async fn dequeue(&self, ctx: &CancellationToken) -> Result<Delivery> {
                self.0.dequeue(ctx).await
            }
            async fn ack(&self, ctx: &CancellationToken, task_id: &str) -> Result<()> {
                self.0.ack(ctx, task_id).await
            }
            async fn nack(&self, _ctx: &CancellationToken, task_id: &str) -> Result<()> {
                Err(QueueError::UnknownTask(task_id.to_string()))
            }
            async fn force_flush(&self, ctx: &CancellationToken) -> Result<()> {
                self.0.force_flush(ctx).await
            }
        }

        let queue = Arc::new(
            Queue::builder()
                .backend(RejectingNack(InMemoryBackend::new()))
                .job(failing_job())
                .build()
                .unwrap(),
        );
        let seen: Seen = Arc::default();
        let ctx = CancellationToken::new();
        let handle = Consumer::new(queue.clone())
            .on_error(recording_hook(seen.clone()))
            .start(&ctx);

        queue
            .enqueue(
                &ctx,
                NewTask::new(TestJob::Echo, Vec::new()).with_task_id("lost"),
            )
            .await
            .unwrap();

        wait_for(&seen, 1).await;
        handle.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            seen.lock().as_slice(),
            &[("unknown task id: lost".to_string(), None)]
        );
    }

    #[tokio::test]
    async fn dequeue_errors_are_reported_then_retried() {
        struct Broken;

        #[async_trait::async_trait]
        impl Backend for Broken {
            async fn enqueue(&self, _ctx: &CancellationToken, _entry: QueueEntry) -> Result<()> {
                Ok(())
            }
            async fn dequeue(&self, _ctx: &CancellationToken) -> Result<Delivery> {
                Err(QueueError::Storage("disk on fire".into()))
            }
            async fn ack(&self, _ctx: &CancellationToken, _task_id: &str) -> Result<()> {
                Ok(())
            }
            async fn nack(&self, _ctx: &CancellationToken, _task_id: &str) -> Result<()> {
                Ok(())
            }
            async fn force_flush(&self, _ctx: &CancellationToken) -> Result<()> {
                Ok(())
            }
        }

        let queue = Arc::new(
            Queue::builder()
                .backend(Broken)
                .job(failing_job())
                .build()
                .unwrap(),
        );
        let seen: Seen = Arc::default();
        let ctx = CancellationToken::new();
        let handle = Consumer::new(queue)
            .with_error_pause(Duration::from_millis(5))
            .on_error(recording_hook(seen.clone()))
            .start(&ctx);

        wait_for(&seen, 3).await;
        handle.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(seen
            .lock()
            .iter()
            .all(|(kind, _)| kind == "queue storage error: disk on fire"));
    }
}
