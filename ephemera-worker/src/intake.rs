//! Newline-delimited JSON enqueue requests read from stdin.
//!
//! Each line looks like
//! `{"job": "create_session", "task_id": "optional", "priority": 5, "payload": {...}}`.

use std::io::BufRead;
use std::sync::Arc;

use ephemera_broker::{CancellationToken, NewTask, Queue};
use ephemera_models::errors::{RuntimeError, SendableError};
use log::{info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::jobs::SessionJob;

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    job: SessionJob,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    payload: serde_json::Value,
}

pub fn parse_request(line: &str) -> Result<NewTask<SessionJob>, SendableError> {
    let request: EnqueueRequest = serde_json::from_str(line).map_err(|err| -> SendableError {
        Box::new(RuntimeError::new("intake.invalid_request", err.to_string()))
    })?;

    let mut task = NewTask::new(request.job, serde_json::to_vec(&request.payload)?);
    if let Some(task_id) = request.task_id {
        task = task.with_task_id(task_id);
    }
    if let Some(priority) = request.priority {
        task = task.with_priority(priority);
    }
    Ok(task)
}

/// Reads stdin on a dedicated thread so a pending read never holds up runtime
/// shutdown. The channel closes at end of input.
pub fn spawn_stdin_reader() -> Result<mpsc::Receiver<String>, SendableError> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::Builder::new()
        .name("stdin-intake".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("Stopped reading stdin: {}", err);
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Enqueues every valid request until input ends or `ctx` is cancelled.
/// Returns the number of tasks accepted.
pub async fn run_intake(
    mut lines: mpsc::Receiver<String>,
    queue: Arc<Queue<SessionJob>>,
    ctx: CancellationToken,
) -> usize {
    let mut accepted = 0;
    loop {
        let line = tokio::select! {
            _ = ctx.cancelled() => break,
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let task = match parse_request(line) {
            Ok(task) => task,
            Err(err) => {
                warn!("Ignoring enqueue request: {}", err);
                continue;
            }
        };

        let job = task.job;
        match queue.enqueue(&ctx, task).await {
            Ok(task_id) => {
                accepted += 1;
                info!("Accepted {} task {}", job, task_id);
            }
            Err(err) if err.is_cancelled() => break,
            Err(err) => warn!("Failed to enqueue {} task: {}", job, err),
        }
    }
    accepted
}
