use chrono::{DateTime, Utc};
use ephemera_broker::{Delivery, QueueError, Result};
use ephemera_models::core::{QueueItem, TaskStatus};
use sqlx::{Row, sqlite::SqliteRow};

pub fn nanos_to_datetime(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

pub fn row_to_delivery(row: &SqliteRow) -> Result<Delivery> {
    Ok(Delivery {
        task_id: row.try_get("id").map_err(QueueError::storage)?,
        job_id: row.try_get("job_id").map_err(QueueError::storage)?,
        payload: row.try_get("payload").map_err(QueueError::storage)?,
    })
}

pub fn row_to_queue_item(row: &SqliteRow) -> Result<QueueItem> {
    let status = row
        .try_get::<String, _>("status")
        .map_err(QueueError::storage)?
        .parse::<TaskStatus>()
        .map_err(QueueError::storage)?;
    let attempts = row.try_get::<i64, _>("attempts").map_err(QueueError::storage)?;

    Ok(QueueItem {
        task_id: row.try_get("id").map_err(QueueError::storage)?,
        job_id: row.try_get("job_id").map_err(QueueError::storage)?,
        payload: row.try_get("payload").map_err(QueueError::storage)?,
        priority: row.try_get("priority").map_err(QueueError::storage)?,
        status,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        available_at: nanos_to_datetime(row.try_get("available_at").map_err(QueueError::storage)?),
        created_at: nanos_to_datetime(row.try_get("created_at").map_err(QueueError::storage)?),
        updated_at: nanos_to_datetime(row.try_get("updated_at").map_err(QueueError::storage)?),
        completed_at: row
            .try_get::<Option<i64>, _>("completed_at")
            .map_err(QueueError::storage)?
            .map(nanos_to_datetime),
    })
}
