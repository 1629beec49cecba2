use crate::batch::{BatchBuffer, BatchPolicy, Buffered};
use crate::{Backend, CancellationToken, Delivery, QueueEntry, QueueError, Result, RetryPolicy};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct InMemoryOptions {
    pub batch: BatchPolicy,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
struct MemoryItem {
    entry: QueueEntry,
    sequence: u64,
    attempts: u32,
}

/// Heap ordering: higher priority first, then lower sequence (older) first.
#[derive(Debug)]
struct Pending(MemoryItem);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .entry
            .priority
            .cmp(&other.0.entry.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

struct MemoryState {
    heap: BinaryHeap<Pending>,
    in_flight: HashMap<String, MemoryItem>,
    batch: BatchBuffer<MemoryItem>,
    delayed: HashMap<String, JoinHandle<()>>,
    // Every task id currently pending, buffered, delayed or in flight.
    live: HashSet<String>,
    next_sequence: u64,
}

impl MemoryState {
    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn push_pending(&mut self, item: MemoryItem) {
        self.heap.push(Pending(item));
    }
}

struct Inner {
    state: Mutex<MemoryState>,
    wake: Notify,
    retry: RetryPolicy,
}

impl Inner {
    fn flush(&self, items: Vec<MemoryItem>) {
        if items.is_empty() {
            return;
        }
        let count = items.len();
        {
            let mut state = self.state.lock();
            for item in items {
                state.push_pending(item);
            }
        }
        debug!("Flushed {} buffered task(s) into the in-memory queue", count);
        self.wake.notify_one();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, timer) in state.delayed.drain() {
            timer.abort();
        }
    }
}

/// Process-local backend: a priority heap with optional batching and delayed
/// retries. Completed tasks are dropped immediately.
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_options(InMemoryOptions::default())
    }

    pub fn with_options(options: InMemoryOptions) -> Self {
        let state = MemoryState {
            heap: BinaryHeap::new(),
            in_flight: HashMap::new(),
            batch: BatchBuffer::new(options.batch),
            delayed: HashMap::new(),
            live: HashSet::new(),
            next_sequence: 0,
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                wake: Notify::new(),
                retry: options.retry,
            }),
        }
    }

    /// Tasks that can be dequeued right now.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().heap.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    fn spawn_flush_timer(&self, generation: u64, wait: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let items = inner.state.lock().batch.take_expired(generation);
            inner.flush(items);
        })
    }

    fn spawn_retry_timer(&self, item: MemoryItem, delay: Duration) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            {
                let mut state = inner.state.lock();
                if state.delayed.remove(&item.entry.task_id).is_none() {
                    return;
                }
                let mut item = item;
                item.sequence = state.next_sequence();
                state.push_pending(item);
            }
            inner.wake.notify_one();
        })
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn enqueue(&self, ctx: &CancellationToken, entry: QueueEntry) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let ready = {
            let mut state = self.inner.state.lock();
            if !state.live.insert(entry.task_id.clone()) {
                return Err(QueueError::DuplicateTask(entry.task_id));
            }

            let item = MemoryItem {
                entry,
                sequence: state.next_sequence(),
                attempts: 0,
            };

            if !state.batch.policy().is_enabled() {
                state.push_pending(item);
                drop(state);
                self.inner.wake.notify_one();
                return Ok(());
            }

            match state.batch.push(item) {
                Buffered::Ready(items) => items,
                Buffered::ArmTimer { generation, wait } => {
                    let timer = self.spawn_flush_timer(generation, wait);
                    state.batch.arm(timer);
                    Vec::new()
                }
                Buffered::Waiting => Vec::new(),
            }
        };

        self.inner.flush(ready);
        Ok(())
    }

    async fn dequeue(&self, ctx: &CancellationToken) -> Result<Delivery> {
        loop {
            if ctx.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let claimed = {
                let mut state = self.inner.state.lock();
                match state.heap.pop() {
                    Some(Pending(item)) => {
                        let delivery = Delivery::from(item.entry.clone());
                        state.in_flight.insert(item.entry.task_id.clone(), item);
                        Some((delivery, !state.heap.is_empty()))
                    }
                    None => None,
                }
            };

            if let Some((delivery, more)) = claimed {
                if more {
                    self.inner.wake.notify_one();
                }
                return Ok(delivery);
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(QueueError::Cancelled),
                _ = self.inner.wake.notified() => {}
            }
        }
    }

    async fn ack(&self, _ctx: &CancellationToken, task_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.in_flight.remove(task_id).is_some() {
            state.live.remove(task_id);
            Ok(())
        } else {
            Err(QueueError::UnknownTask(task_id.to_string()))
        }
    }

    async fn nack(&self, _ctx: &CancellationToken, task_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        let Some(mut item) = state.in_flight.remove(task_id) else {
            return Err(QueueError::UnknownTask(task_id.to_string()));
        };

        item.attempts = item.attempts.saturating_add(1);
        if self.inner.retry.is_exhausted(item.attempts) {
            state.live.remove(task_id);
            warn!(
                "Task {} failed permanently after {} attempt(s)",
                task_id, item.attempts
            );
            return Err(QueueError::RetriesExceeded(task_id.to_string()));
        }

        let delay = self.inner.retry.delay_for(item.attempts);
        if delay.is_zero() {
            item.sequence = state.next_sequence();
            state.push_pending(item);
            drop(state);
            self.inner.wake.notify_one();
            return Ok(());
        }

        debug!(
            "Task {} will be retried in {:?} (attempt {})",
            task_id, delay, item.attempts
        );
        let timer = self.spawn_retry_timer(item, delay);
        if let Some(previous) = state.delayed.insert(task_id.to_string(), timer) {
            previous.abort();
        }
        Ok(())
    }

    async fn force_flush(&self, _ctx: &CancellationToken) -> Result<()> {
        let items = self.inner.state.lock().batch.take();
        self.inner.flush(items);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        let buffered = state.batch.take();
        if !buffered.is_empty() {
            warn!(
                "Closing in-memory queue with {} buffered task(s)",
                buffered.len()
            );
        }
        for (_, timer) in state.delayed.drain() {
            timer.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Backoff;
    use std::collections::HashSet;
    use tokio::time::timeout;

    fn entry(task_id: &str, priority: i64) -> QueueEntry {
        QueueEntry {
            job_id: "alpha".into(),
            task_id: task_id.into(),
            payload: task_id.as_bytes().to_vec(),
            priority,
        }
    }

    fn with_retry(max_retries: Option<u32>) -> InMemoryBackend {
        InMemoryBackend::with_options(InMemoryOptions {
            retry: RetryPolicy::new(max_retries),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let backend = InMemoryBackend::new();
        let ctx = CancellationToken::new();

        backend.enqueue(&ctx, entry("low", 1)).await.unwrap();
        backend.enqueue(&ctx, entry("high", 10)).await.unwrap();

        assert_eq!(backend.dequeue(&ctx).await.unwrap().task_id, "high");
        assert_eq!(backend.dequeue(&ctx).await.unwrap().task_id, "low");
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let backend = InMemoryBackend::new();
        let ctx = CancellationToken::new();

        for id in ["a", "b", "c"] {
            backend.enqueue(&ctx, entry(id, 5)).await.unwrap();
        }

        for expected in ["a", "b", "c"] {
            assert_eq!(backend.dequeue(&ctx).await.unwrap().task_id, expected);
        }
    }

    #[tokio::test]
    async fn dequeue_blocks_until_enqueue() {
        let backend = InMemoryBackend::new();
        let ctx = CancellationToken::new();

        let waiter = {
            let backend = backend.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { backend.dequeue(&ctx).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        backend.enqueue(&ctx, entry("late", 0)).await.unwrap();
        let delivery = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("dequeue should wake")
            .unwrap()
            .unwrap();
        assert_eq!(delivery.task_id, "late");
    }

    #[tokio::test]
    async fn cancelled_dequeue_returns_promptly() {
        let backend = InMemoryBackend::new();
        let ctx = CancellationToken::new();

        let waiter = {
            let backend = backend.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { backend.dequeue(&ctx).await })
        };
        ctx.cancel();

        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(QueueError::Cancelled)));
    }

    #[tokio::test]
    async fn enqueue_on_cancelled_context_fails() {
        let backend = InMemoryBackend::new();
        let ctx = CancellationToken::new();
        ctx.cancel();

        let result = backend.enqueue(&ctx, entry("x", 0)).await;
        assert!(matches!(result, Err(QueueError::Cancelled)));
        assert_eq!(backend.pending_len(), 0);
    }

    #[tokio::test]
    async fn duplicate_live_task_id_is_rejected() {
        let backend = InMemoryBackend::new();
        let ctx = CancellationToken::new();

        backend.enqueue(&ctx, entry("dup", 0)).await.unwrap();
        let result = backend.enqueue(&ctx, entry("dup", 0)).await;
        assert!(matches!(result, Err(QueueError::DuplicateTask(id)) if id == "dup"));

        backend.dequeue(&ctx).await.unwrap();
        backend.ack(&ctx, "dup").await.unwrap();
        backend.enqueue(&ctx, entry("dup", 0)).await.unwrap();
    }

    #[tokio::test]
    async fn ack_removes_in_flight_task() {
        let backend = InMemoryBackend::new();
        let ctx = CancellationToken::new();

        backend.enqueue(&ctx, entry("t", 0)).await.unwrap();
        backend.dequeue(&ctx).await.unwrap();
        assert_eq!(backend.in_flight_len(), 1);

        backend.ack(&ctx, "t").await.unwrap();
        assert_eq!(backend.in_flight_len(), 0);
        assert!(matches!(
            backend.ack(&ctx, "t").await,
            Err(QueueError::UnknownTask(id)) if id == "t"
        ));
    }

    #[tokio::test]
    async fn nack_without_delay_requeues_behind_equal_priority() {
        let backend = with_retry(None);
        let ctx = CancellationToken::new();

        backend.enqueue(&ctx, entry("first", 1)).await.unwrap();
        backend.enqueue(&ctx, entry("second", 1)).await.unwrap();

        assert_eq!(backend.dequeue(&ctx).await.unwrap().task_id, "first");
        backend.nack(&ctx, "first").await.unwrap();

        assert_eq!(backend.dequeue(&ctx).await.unwrap().task_id, "second");
        assert_eq!(backend.dequeue(&ctx).await.unwrap().task_id, "first");
    }

    #[tokio::test]
    async fn retry_max_zero_fails_on_first_nack() {
        let backend = with_retry(Some(0));
        let ctx = CancellationToken::new();

        backend.enqueue(&ctx, entry("once", 0)).await.unwrap();
        backend.dequeue(&ctx).await.unwrap();

        let result = backend.nack(&ctx, "once").await;
        assert!(matches!(result, Err(QueueError::RetriesExceeded(id)) if id == "once"));
        assert_eq!(backend.pending_len(), 0);
        assert!(matches!(
            backend.nack(&ctx, "once").await,
            Err(QueueError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn task_fails_after_retry_max_plus_one_nacks() {
        let backend = with_retry(Some(2));
        let ctx = CancellationToken::new();

        backend.enqueue(&ctx, entry("flaky", 0)).await.unwrap();
        for _ in 0..2 {
            backend.dequeue(&ctx).await.unwrap();
            backend.nack(&ctx, "flaky").await.unwrap();
        }
        backend.dequeue(&ctx).await.unwrap();
        assert!(backend.nack(&ctx, "flaky").await.unwrap_err().is_retries_exceeded());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_retry_is_hidden_until_due() {
        let backend = InMemoryBackend::with_options(InMemoryOptions {
            retry: RetryPolicy::new(None).with_backoff(Backoff::new(
                Duration::from_secs(5),
                2.0,
                Duration::ZERO,
            )),
            ..Default::default()
        });
        let ctx = CancellationToken::new();

        backend.enqueue(&ctx, entry("later", 0)).await.unwrap();
        backend.dequeue(&ctx).await.unwrap();
        backend.nack(&ctx, "later").await.unwrap();
        assert_eq!(backend.pending_len(), 0);

        assert!(timeout(Duration::from_secs(4), backend.dequeue(&ctx))
            .await
            .is_err());

        let delivery = timeout(Duration::from_secs(2), backend.dequeue(&ctx))
            .await
            .expect("retry should become visible")
            .unwrap();
        assert_eq!(delivery.task_id, "later");
    }

    #[tokio::test]
    async fn batch_size_threshold_controls_visibility() {
        let backend = InMemoryBackend::with_options(InMemoryOptions {
            batch: BatchPolicy::new(2, Duration::ZERO),
            ..Default::default()
        });
        let ctx = CancellationToken::new();

        backend.enqueue(&ctx, entry("one", 0)).await.unwrap();
        assert!(timeout(Duration::from_millis(50), backend.dequeue(&ctx))
            .await
            .is_err());

        backend.enqueue(&ctx, entry("two", 0)).await.unwrap();
        let first = timeout(Duration::from_secs(1), backend.dequeue(&ctx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.task_id, "one");
    }

    #[tokio::test]
    async fn force_flush_releases_partial_batch() {
        let backend = InMemoryBackend::with_options(InMemoryOptions {
            batch: BatchPolicy::new(10, Duration::ZERO),
            ..Default::default()
        });
        let ctx = CancellationToken::new();

        backend.enqueue(&ctx, entry("solo", 0)).await.unwrap();
        assert_eq!(backend.pending_len(), 0);

        backend.force_flush(&ctx).await.unwrap();
        let delivery = timeout(Duration::from_secs(1), backend.dequeue(&ctx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.task_id, "solo");
    }

    #[tokio::test(start_paused = true)]
    async fn batch_wait_flushes_after_deadline() {
        let backend = InMemoryBackend::with_options(InMemoryOptions {
            batch: BatchPolicy::new(0, Duration::from_millis(200)),
            ..Default::default()
        });
        let ctx = CancellationToken::new();

        backend.enqueue(&ctx, entry("timed", 0)).await.unwrap();
        assert!(timeout(Duration::from_millis(100), backend.dequeue(&ctx))
            .await
            .is_err());

        let delivery = timeout(Duration::from_millis(200), backend.dequeue(&ctx))
            .await
            .expect("batch timer should flush")
            .unwrap();
        assert_eq!(delivery.task_id, "timed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_never_share_a_task() {
        let backend = InMemoryBackend::new();
        let ctx = CancellationToken::new();
        let total = 200;

        let mut workers = Vec::new();
        for _ in 0..4 {
            let backend = backend.clone();
            let ctx = ctx.clone();
            workers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(delivery) = backend.dequeue(&ctx).await {
                    backend.ack(&ctx, &delivery.task_id).await.unwrap();
                    seen.push(delivery.task_id);
                }
                seen
            }));
        }

        for i in 0..total {
            backend
                .enqueue(&ctx, entry(&format!("task-{i}"), (i % 3) as i64))
                .await
                .unwrap();
        }

        while backend.pending_len() > 0 || backend.in_flight_len() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ctx.cancel();

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.await.unwrap() {
                assert!(seen.insert(id.clone()), "task {id} delivered twice");
            }
        }
        assert_eq!(seen.len(), total);
    }
}
