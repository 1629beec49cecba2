use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ephemera_broker::batch::{BatchBuffer, Buffered};
use ephemera_broker::{
    Backend, BatchPolicy, CancellationToken, Delivery, QueueEntry, QueueError, Result, RetryPolicy,
};
use ephemera_models::core::{QueueItem, TaskStatus};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, QueryBuilder, Sqlite};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::mappers::{row_to_delivery, row_to_queue_item};
use crate::statements::{ROWS_PER_INSERT, Statements, validate_queue_name};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Table backing the queue; must match `[A-Za-z_][A-Za-z0-9_]*`.
    pub queue_name: String,
    pub batch: BatchPolicy,
    pub retry: RetryPolicy,
    /// Upper bound on how long an idle dequeue waits before re-checking the
    /// table, which is what surfaces delayed retries.
    pub poll_interval: Duration,
}

impl SqliteOptions {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            batch: BatchPolicy::disabled(),
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A task waiting in the write batch. Timestamps are taken at enqueue time so
/// buffering never changes the dequeue order.
#[derive(Debug)]
struct BufferedRow {
    entry: QueueEntry,
    available_at: i64,
    created_at: i64,
}

struct Inner {
    pool: SqlitePool,
    owns_pool: bool,
    statements: Statements,
    retry: RetryPolicy,
    poll_interval: Duration,
    batch: Mutex<BatchBuffer<BufferedRow>>,
    clock: AtomicI64,
    wake: Notify,
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn delay_nanos(delay: Duration) -> i64 {
    i64::try_from(delay.as_nanos()).unwrap_or(i64::MAX)
}

impl Inner {
    /// Strictly increasing per instance, so rows created in the same
    /// nanosecond still keep their enqueue order.
    fn stamp(&self) -> i64 {
        let now = now_nanos();
        let previous = self
            .clock
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        now.max(previous.saturating_add(1))
    }

    /// Writes buffered rows. On failure the rows go back into the buffer for the
    /// next flush, except the newest one when `caller_owns_newest` is set: that
    /// row belongs to the enqueue reporting the error and must not be persisted.
    async fn flush(
        self: &Arc<Self>,
        mut rows: Vec<BufferedRow>,
        caller_owns_newest: bool,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        match self.insert_rows(&rows).await {
            Ok(inserted) => {
                let skipped = rows.len() as u64 - inserted.min(rows.len() as u64);
                if skipped > 0 {
                    warn!(
                        "Skipped {} buffered task(s) whose ids already exist in {}",
                        skipped,
                        self.table()
                    );
                }
                debug!("Flushed {} task(s) into {}", inserted, self.table());
                self.wake.notify_one();
                Ok(())
            }
            Err(err) => {
                if caller_owns_newest {
                    if let Some(rejected) = rows.pop() {
                        debug!("Discarded task {} after a failed flush", rejected.entry.task_id);
                    }
                }
                if !rows.is_empty() {
                    warn!(
                        "Keeping {} buffered task(s) for {} after a failed flush",
                        rows.len(),
                        self.table()
                    );
                }
                let mut batch = self.batch.lock();
                if let Buffered::ArmTimer { generation, wait } = batch.restore(rows) {
                    batch.arm(spawn_flush_timer(Arc::downgrade(self), generation, wait));
                }
                Err(err)
            }
        }
    }

    async fn insert_rows(&self, rows: &[BufferedRow]) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(QueueError::storage)?;
        let mut inserted = 0;

        for chunk in rows.chunks(ROWS_PER_INSERT) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new(self.statements.insert_many.as_str());
            builder.push_values(chunk, |mut values, row| {
                values
                    .push_bind(row.entry.task_id.as_str())
                    .push_bind(row.entry.job_id.as_str())
                    .push_bind(row.entry.payload.as_slice())
                    .push_bind(row.entry.priority)
                    .push_bind(TaskStatus::Pending.as_str())
                    .push_bind(0_i64)
                    .push_bind(row.available_at)
                    .push_bind(row.created_at)
                    .push_bind(row.created_at);
            });
            builder.push(" ON CONFLICT(id) DO NOTHING");

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(QueueError::storage)?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(QueueError::storage)?;
        Ok(inserted)
    }

    fn table(&self) -> &str {
        &self.statements.table
    }
}

/// Durable backend storing one queue per SQLite table.
///
/// Completed and failed rows are retained; ids are therefore never reusable
/// within the same table.
#[derive(Clone)]
pub struct SqliteBackend {
    inner: Arc<Inner>,
}

impl SqliteBackend {
    /// Opens (creating if needed) the database at `path`. The backend owns the
    /// pool and closes it on [`Backend::close`].
    pub async fn open(path: impl AsRef<Path>, options: SqliteOptions) -> Result<Self> {
        validate_queue_name(&options.queue_name)?;

        let connect = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .log_statements(log::LevelFilter::Debug)
            .log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(1));
        let pool = SqlitePoolOptions::new()
            .connect_with(connect)
            .await
            .map_err(QueueError::storage)?;

        info!(
            "Opened queue '{}' in {}",
            options.queue_name,
            path.as_ref().display()
        );
        Self::init(pool, true, options).await
    }

    /// Uses a caller-supplied pool, which is left open on [`Backend::close`].
    pub async fn with_pool(pool: SqlitePool, options: SqliteOptions) -> Result<Self> {
        validate_queue_name(&options.queue_name)?;
        Self::init(pool, false, options).await
    }

    async fn init(pool: SqlitePool, owns_pool: bool, options: SqliteOptions) -> Result<Self> {
        let statements = Statements::new(&options.queue_name);
        sqlx::query(&statements.create_table)
            .execute(&pool)
            .await
            .map_err(QueueError::storage)?;
        sqlx::query(&statements.create_index)
            .execute(&pool)
            .await
            .map_err(QueueError::storage)?;

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                owns_pool,
                statements,
                retry: options.retry,
                poll_interval: options.poll_interval,
                batch: Mutex::new(BatchBuffer::new(options.batch)),
                clock: AtomicI64::new(0),
                wake: Notify::new(),
            }),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    /// Reads the stored record for `task_id`, whatever its status.
    pub async fn fetch_item(&self, task_id: &str) -> Result<Option<QueueItem>> {
        let row = sqlx::query(&self.inner.statements.fetch)
            .bind(task_id)
            .fetch_optional(&self.inner.pool)
            .await
            .map_err(QueueError::storage)?;
        row.as_ref().map(row_to_queue_item).transpose()
    }

    pub async fn count(&self, status: TaskStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&self.inner.statements.count)
            .bind(status.as_str())
            .fetch_one(&self.inner.pool)
            .await
            .map_err(QueueError::storage)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Returns rows left in flight by a previous process to `pending`. Only safe
    /// while no consumer is attached to this table.
    pub async fn requeue_in_flight(&self) -> Result<u64> {
        let result = sqlx::query(&self.inner.statements.recover)
            .bind(now_nanos())
            .execute(&self.inner.pool)
            .await
            .map_err(QueueError::storage)?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(
                "Requeued {} task(s) left in flight in {}",
                recovered,
                self.inner.table()
            );
            self.inner.wake.notify_one();
        }
        Ok(recovered)
    }

    async fn insert_one(&self, row: BufferedRow) -> Result<()> {
        let result = sqlx::query(&self.inner.statements.insert)
            .bind(row.entry.task_id.as_str())
            .bind(row.entry.job_id.as_str())
            .bind(row.entry.payload.as_slice())
            .bind(row.entry.priority)
            .bind(row.available_at)
            .bind(row.created_at)
            .bind(row.created_at)
            .execute(&self.inner.pool)
            .await;

        match result {
            Ok(_) => {
                self.inner.wake.notify_one();
                Ok(())
            }
            Err(err) if is_unique_violation(&err) => {
                Err(QueueError::DuplicateTask(row.entry.task_id))
            }
            Err(err) => Err(QueueError::storage(err)),
        }
    }

    async fn claim_next(&self) -> Result<Option<Delivery>> {
        let now = now_nanos();
        let mut tx = self.inner.pool.begin().await.map_err(QueueError::storage)?;
        let row = sqlx::query(&self.inner.statements.claim)
            .bind(now)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(QueueError::storage)?;
        tx.commit().await.map_err(QueueError::storage)?;
        row.as_ref().map(row_to_delivery).transpose()
    }
}

/// Flushes the batch of `generation` once `wait` has elapsed, unless it was
/// already flushed or the backend is gone.
fn spawn_flush_timer(inner: Weak<Inner>, generation: u64, wait: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let rows = inner.batch.lock().take_expired(generation);
        if let Err(err) = inner.flush(rows, false).await {
            error!("Timed batch flush into {} failed: {}", inner.table(), err);
        }
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn enqueue(&self, ctx: &CancellationToken, entry: QueueEntry) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let row = BufferedRow {
            entry,
            available_at: now_nanos(),
            created_at: self.inner.stamp(),
        };

        if !self.inner.batch.lock().policy().is_enabled() {
            return self.insert_one(row).await;
        }

        let ready = {
            let mut batch = self.inner.batch.lock();
            match batch.push(row) {
                Buffered::Ready(rows) => rows,
                Buffered::ArmTimer { generation, wait } => {
                    batch.arm(spawn_flush_timer(
                        Arc::downgrade(&self.inner),
                        generation,
                        wait,
                    ));
                    Vec::new()
                }
                Buffered::Waiting => Vec::new(),
            }
        };
        self.inner.flush(ready, true).await
    }

    async fn dequeue(&self, ctx: &CancellationToken) -> Result<Delivery> {
        loop {
            if ctx.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            if let Some(delivery) = self.claim_next().await? {
                self.inner.wake.notify_one();
                return Ok(delivery);
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(QueueError::Cancelled),
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
            }
        }
    }

    async fn ack(&self, _ctx: &CancellationToken, task_id: &str) -> Result<()> {
        let now = now_nanos();
        let result = sqlx::query(&self.inner.statements.ack)
            .bind(now)
            .bind(now)
            .bind(task_id)
            .execute(&self.inner.pool)
            .await
            .map_err(QueueError::storage)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownTask(task_id.to_string()));
        }
        Ok(())
    }

    async fn nack(&self, _ctx: &CancellationToken, task_id: &str) -> Result<()> {
        let now = now_nanos();
        let mut tx = self.inner.pool.begin().await.map_err(QueueError::storage)?;

        let attempts: Option<i64> = sqlx::query_scalar(&self.inner.statements.bump_attempts)
            .bind(now)
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(QueueError::storage)?;
        let Some(attempts) = attempts else {
            tx.rollback().await.map_err(QueueError::storage)?;
            return Err(QueueError::UnknownTask(task_id.to_string()));
        };
        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX);

        if self.inner.retry.is_exhausted(attempts) {
            sqlx::query(&self.inner.statements.fail)
                .bind(now)
                .bind(now)
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(QueueError::storage)?;
            tx.commit().await.map_err(QueueError::storage)?;
            warn!(
                "Task {} failed permanently after {} attempt(s)",
                task_id, attempts
            );
            return Err(QueueError::RetriesExceeded(task_id.to_string()));
        }

        let delay = self.inner.retry.delay_for(attempts);
        let available_at = now.saturating_add(delay_nanos(delay));
        let requeued_at = if delay.is_zero() {
            self.inner.stamp()
        } else {
            available_at
        };
        sqlx::query(&self.inner.statements.retry)
            .bind(available_at)
            .bind(requeued_at)
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(QueueError::storage)?;
        tx.commit().await.map_err(QueueError::storage)?;

        if !delay.is_zero() {
            debug!(
                "Task {} will be retried in {:?} (attempt {})",
                task_id, delay, attempts
            );
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    async fn force_flush(&self, _ctx: &CancellationToken) -> Result<()> {
        let rows = self.inner.batch.lock().take();
        self.inner.flush(rows, false).await
    }

    async fn close(&self) -> Result<()> {
        let rows = self.inner.batch.lock().take();
        self.inner.flush(rows, false).await?;
        if self.inner.owns_pool {
            self.inner.pool.close().await;
            info!("Closed queue database for {}", self.inner.table());
        }
        Ok(())
    }
}
