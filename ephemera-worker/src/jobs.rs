use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use ephemera_broker::{CancellationToken, Job, JobHandler, JobKey, Task};
use ephemera_models::errors::{RuntimeError, SendableError};
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionJob {
    CreateSession,
    DeleteSession,
    CompleteSession,
}

impl JobKey for SessionJob {
    fn as_str(&self) -> &'static str {
        match self {
            SessionJob::CreateSession => "create_session",
            SessionJob::DeleteSession => "delete_session",
            SessionJob::CompleteSession => "complete_session",
        }
    }
}

impl fmt::Display for SessionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionJob {
    type Err = RuntimeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "create_session" => Ok(SessionJob::CreateSession),
            "delete_session" => Ok(SessionJob::DeleteSession),
            "complete_session" => Ok(SessionJob::CompleteSession),
            other => Err(RuntimeError::new(
                "session.unknown_job",
                format!("unknown session job '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: String,
    pub repository: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSessionRequest {
    pub session_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteSessionRequest {
    pub session_id: String,
    #[serde(default)]
    pub summary: Option<String>,
}

fn decode<T: DeserializeOwned>(task: &Task<SessionJob>) -> Result<T, SendableError> {
    serde_json::from_slice(&task.payload).map_err(|err| -> SendableError {
        Box::new(RuntimeError::new(
            "session.invalid_payload",
            format!("{} task {}: {}", task.job, task.task_id, err),
        ))
    })
}

fn require(field: &str, value: &str) -> Result<(), SendableError> {
    if value.trim().is_empty() {
        return Err(Box::new(RuntimeError::new(
            "session.invalid_request",
            format!("{field} must not be empty"),
        )));
    }
    Ok(())
}

fn ensure_running(ctx: &CancellationToken, task: &Task<SessionJob>) -> Result<(), SendableError> {
    if ctx.is_cancelled() {
        return Err(Box::new(RuntimeError::new(
            "session.shutting_down",
            format!("{} task {} interrupted by shutdown", task.job, task.task_id),
        )));
    }
    Ok(())
}

// TODO: creation is not idempotent once worktree/tmux side effects are wired
// in here; a retry after a crash between the side effect and the ack would
// create the session twice. Key the side effect on session_id first.
pub struct CreateSessionHandler;

#[async_trait]
impl JobHandler<SessionJob> for CreateSessionHandler {
    async fn handle(
        &self,
        ctx: CancellationToken,
        task: Task<SessionJob>,
    ) -> Result<(), SendableError> {
        let request: CreateSessionRequest = decode(&task)?;
        require("session_id", &request.session_id)?;
        require("repository", &request.repository)?;
        ensure_running(&ctx, &task)?;

        info!(
            "Creating session {} for {} (branch {})",
            request.session_id,
            request.repository,
            request.branch.as_deref().unwrap_or("default")
        );
        Ok(())
    }
}

pub struct DeleteSessionHandler;

#[async_trait]
impl JobHandler<SessionJob> for DeleteSessionHandler {
    async fn handle(
        &self,
        ctx: CancellationToken,
        task: Task<SessionJob>,
    ) -> Result<(), SendableError> {
        let request: DeleteSessionRequest = decode(&task)?;
        require("session_id", &request.session_id)?;
        ensure_running(&ctx, &task)?;

        info!(
            "Deleting session {}{}",
            request.session_id,
            if request.force { " (forced)" } else { "" }
        );
        Ok(())
    }
}

pub struct CompleteSessionHandler;

#[async_trait]
impl JobHandler<SessionJob> for CompleteSessionHandler {
    async fn handle(
        &self,
        ctx: CancellationToken,
        task: Task<SessionJob>,
    ) -> Result<(), SendableError> {
        let request: CompleteSessionRequest = decode(&task)?;
        require("session_id", &request.session_id)?;
        ensure_running(&ctx, &task)?;

        info!("Completing session {}", request.session_id);
        Ok(())
    }
}

/// Teardown runs ahead of creation so a busy queue frees resources first.
pub fn session_jobs() -> Vec<Job<SessionJob>> {
    vec![
        Job::new(SessionJob::DeleteSession, 20).with_handler(DeleteSessionHandler),
        Job::new(SessionJob::CompleteSession, 10).with_handler(CompleteSessionHandler),
        Job::new(SessionJob::CreateSession, 0).with_handler(CreateSessionHandler),
    ]
}
