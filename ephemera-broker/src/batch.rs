//! Write batching shared by the backends.
//!
//! Items are buffered until the buffer holds `max_size` items, `max_wait` has
//! elapsed since the first buffered item, or the owner forces a flush.

use std::mem;
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Flush once this many items are buffered. Zero disables the size trigger.
    pub max_size: usize,
    /// Flush this long after the first buffered item. Zero disables the timer.
    pub max_wait: Duration,
}

impl BatchPolicy {
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self { max_size, max_wait }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.max_size > 0 || !self.max_wait.is_zero()
    }
}

/// What the owner has to do after [`BatchBuffer::push`].
#[derive(Debug)]
pub enum Buffered<T> {
    /// The size threshold was reached; materialize these items now.
    Ready(Vec<T>),
    /// First item of a new batch; arm a flush timer for this generation.
    ArmTimer { generation: u64, wait: Duration },
    Waiting,
}

#[derive(Debug)]
pub struct BatchBuffer<T> {
    policy: BatchPolicy,
    items: Vec<T>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl<T> BatchBuffer<T> {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            items: Vec::new(),
            timer: None,
            generation: 0,
        }
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, item: T) -> Buffered<T> {
        self.items.push(item);

        if self.policy.max_size > 0 && self.items.len() >= self.policy.max_size {
            return Buffered::Ready(self.take());
        }

        if self.items.len() == 1 && !self.policy.max_wait.is_zero() {
            self.generation = self.generation.wrapping_add(1);
            return Buffered::ArmTimer {
                generation: self.generation,
                wait: self.policy.max_wait,
            };
        }

        Buffered::Waiting
    }

    /// Installs the flush timer for the current batch, stopping any previous one.
    pub fn arm(&mut self, timer: JoinHandle<()>) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.abort();
        }
    }

    /// Drains the buffer and stops the pending flush timer.
    pub fn take(&mut self) -> Vec<T> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        mem::take(&mut self.items)
    }

    /// Drains the buffer on behalf of the flush timer of `generation`.
    ///
    /// Returns nothing when the batch that armed the timer was already flushed,
    /// so a late timer never cuts a newer batch short. The timer's own handle is
    /// released rather than aborted since it is the caller.
    pub fn take_expired(&mut self, generation: u64) -> Vec<T> {
        if generation != self.generation || self.timer.is_none() {
            return Vec::new();
        }
        self.timer = None;
        mem::take(&mut self.items)
    }

    /// Puts items from a failed flush back in front of anything buffered since.
    ///
    /// Returns [`Buffered::ArmTimer`] when the restored batch has no flush timer
    /// left and the policy has a wait, so it is retried after `max_wait` instead
    /// of sitting until the next forced flush.
    pub fn restore(&mut self, mut items: Vec<T>) -> Buffered<T> {
        items.append(&mut self.items);
        self.items = items;

        if self.items.is_empty() || self.timer.is_some() || self.policy.max_wait.is_zero() {
            return Buffered::Waiting;
        }
        self.generation = self.generation.wrapping_add(1);
        Buffered::ArmTimer {
            generation: self.generation,
            wait: self.policy.max_wait,
        }
    }
}

impl<T> Drop for BatchBuffer<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
