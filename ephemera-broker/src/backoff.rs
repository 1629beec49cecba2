//! Retry delay computation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Largest delay a backend will schedule; matches the nanosecond range stored
/// by the durable backend.
pub const MAX_DELAY: Duration = Duration::from_nanos(i64::MAX as u64);

const DEFAULT_FACTOR: f64 = 2.0;

/// Maps a task's attempt count to the delay before it becomes eligible again.
pub type RetryDelay = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Exponential backoff: `base * factor^(attempts - 1)`, capped at `max`.
///
/// A zero `base` disables the delay, a non-positive `factor` falls back to 2
/// and a zero `max` leaves the delay uncapped (saturating at [`MAX_DELAY`]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, max: Duration) -> Self {
        Self { base, factor, max }
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 || self.base.is_zero() {
            return Duration::ZERO;
        }

        let factor = if self.factor > 0.0 {
            self.factor
        } else {
            DEFAULT_FACTOR
        };
        let ceiling = if self.max.is_zero() {
            MAX_DELAY
        } else {
            self.max.min(MAX_DELAY)
        };

        let exponent = i32::try_from(attempts - 1).unwrap_or(i32::MAX);
        let nanos = self.base.as_nanos() as f64 * factor.powi(exponent);
        if !nanos.is_finite() || nanos >= ceiling.as_nanos() as f64 {
            return ceiling;
        }
        Duration::from_nanos(nanos as u64)
    }

    pub fn into_retry_delay(self) -> RetryDelay {
        Arc::new(move |attempts| self.delay(attempts))
    }
}

/// How a backend reacts to `nack`.
#[derive(Clone, Default)]
pub struct RetryPolicy {
    /// `None` retries forever; `Some(k)` fails the task on its `k + 1`-th nack.
    pub max_retries: Option<u32>,
    pub delay: Option<RetryDelay>,
}

impl RetryPolicy {
    pub fn new(max_retries: Option<u32>) -> Self {
        Self {
            max_retries,
            delay: None,
        }
    }

    pub fn with_backoff(self, backoff: Backoff) -> Self {
        self.with_delay(backoff.into_retry_delay())
    }

    pub fn with_delay(mut self, delay: RetryDelay) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_retries, Some(max) if attempts > max)
    }

    pub fn delay_for(&self, attempts: u32) -> Duration {
        self.delay
            .as_ref()
            .map(|delay| delay(attempts))
            .unwrap_or(Duration::ZERO)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("delay", &self.delay.as_ref().map(|_| "<fn>"))
            .finish()
    }
}
