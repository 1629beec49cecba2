use std::sync::LazyLock;

use ephemera_broker::{QueueError, Result};
use regex::Regex;

static QUEUE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("queue name regex"));

/// SQLite's default `SQLITE_MAX_VARIABLE_NUMBER`.
pub const MAX_PARAMETERS: usize = 999;
pub const INSERT_COLUMNS: usize = 9;
pub const ROWS_PER_INSERT: usize = MAX_PARAMETERS / INSERT_COLUMNS;

pub fn validate_queue_name(name: &str) -> Result<()> {
    if QUEUE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(QueueError::InvalidQueueName(name.to_string()))
    }
}

/// SQL for one queue table, rendered once per backend.
#[derive(Debug, Clone)]
pub struct Statements {
    pub table: String,
    pub create_table: String,
    pub create_index: String,
    pub insert: String,
    pub insert_many: String,
    pub claim: String,
    pub ack: String,
    pub bump_attempts: String,
    pub fail: String,
    pub retry: String,
    pub fetch: String,
    pub count: String,
    pub recover: String,
}

impl Statements {
    /// `table` must already have passed [`validate_queue_name`].
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL,
                    payload BLOB NOT NULL,
                    priority INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    available_at INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    completed_at INTEGER
                )"
            ),
            create_index: format!(
                "CREATE INDEX IF NOT EXISTS {table}_dequeue_idx
                    ON {table} (status, available_at, priority DESC, created_at ASC)"
            ),
            insert: format!(
                "INSERT INTO {table}
                    (id, job_id, payload, priority, status, attempts,
                     available_at, created_at, updated_at)
                 VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?)"
            ),
            insert_many: format!(
                "INSERT INTO {table}
                    (id, job_id, payload, priority, status, attempts,
                     available_at, created_at, updated_at) "
            ),
            claim: format!(
                "UPDATE {table} SET status = 'in_flight', updated_at = ?
                 WHERE id = (
                     SELECT id FROM {table}
                     WHERE status = 'pending' AND available_at <= ?
                     ORDER BY priority DESC, created_at ASC
                     LIMIT 1
                 ) AND status = 'pending'
                 RETURNING id, job_id, payload"
            ),
            ack: format!(
                "UPDATE {table} SET status = 'completed', updated_at = ?, completed_at = ?
                 WHERE id = ? AND status = 'in_flight'"
            ),
            bump_attempts: format!(
                "UPDATE {table} SET attempts = attempts + 1, updated_at = ?
                 WHERE id = ? AND status = 'in_flight'
                 RETURNING attempts"
            ),
            fail: format!(
                "UPDATE {table} SET status = 'failed', updated_at = ?, completed_at = ?
                 WHERE id = ?"
            ),
            retry: format!(
                "UPDATE {table}
                 SET status = 'pending', available_at = ?, created_at = ?, updated_at = ?
                 WHERE id = ?"
            ),
            fetch: format!(
                "SELECT id, job_id, payload, priority, status, attempts,
                        available_at, created_at, updated_at, completed_at
                 FROM {table} WHERE id = ?"
            ),
            count: format!("SELECT COUNT(*) FROM {table} WHERE status = ?"),
            recover: format!(
                "UPDATE {table} SET status = 'pending', updated_at = ?
                 WHERE status = 'in_flight'"
            ),
        }
    }
}
