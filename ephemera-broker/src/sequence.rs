//! Task identifier generation for tasks enqueued without an explicit id.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

pub trait TaskIdGenerator: Send + Sync + 'static {
    /// Returns a fresh identifier. An empty string is treated as a
    /// configuration error by the queue.
    fn next_id(&self) -> String;
}

/// Process-local counter: `1`, `2`, `3`, ...
///
/// Ids restart with the process, so durable queues that retain rows should
/// prefer [`UuidGenerator`].
#[derive(Debug, Default)]
pub struct CounterGenerator {
    last: AtomicU64,
}

impl CounterGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskIdGenerator for CounterGenerator {
    fn next_id(&self) -> String {
        (self.last.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl TaskIdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

impl<F> TaskIdGenerator for F
where
    F: Fn() -> String + Send + Sync + 'static,
{
    fn next_id(&self) -> String {
        self()
    }
}
