use crate::job::{Job, JobHandler, JobKey, NewTask};
use crate::sequence::{CounterGenerator, TaskIdGenerator};
use crate::{Backend, CancellationToken, QueueEntry, QueueError, Result};
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub(crate) struct RegisteredJob<J: JobKey> {
    pub(crate) priority: i64,
    pub(crate) handler: Arc<dyn JobHandler<J>>,
}

pub struct QueueBuilder<J: JobKey> {
    backend: Option<Arc<dyn Backend>>,
    jobs: Vec<Job<J>>,
    generator: Option<Arc<dyn TaskIdGenerator>>,
}

impl<J: JobKey> Default for QueueBuilder<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: JobKey> QueueBuilder<J> {
    pub fn new() -> Self {
        Self {
            backend: None,
            jobs: Vec::new(),
            generator: None,
        }
    }

    pub fn backend<B: Backend>(self, backend: B) -> Self {
        self.shared_backend(Arc::new(backend))
    }

    pub fn shared_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn job(mut self, job: Job<J>) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn jobs(mut self, jobs: impl IntoIterator<Item = Job<J>>) -> Self {
        self.jobs.extend(jobs);
        self
    }

    /// Replaces the default counter-based task id generator.
    pub fn generator<G: TaskIdGenerator>(mut self, generator: G) -> Self {
        self.generator = Some(Arc::new(generator));
        self
    }

    pub fn build(self) -> Result<Queue<J>> {
        let backend = self.backend.ok_or(QueueError::MissingBackend)?;

        let mut jobs = HashMap::with_capacity(self.jobs.len());
        let mut by_name = HashMap::with_capacity(self.jobs.len());
        for job in self.jobs {
            let (id, priority, handler) = job.into_parts();
            let name = id.as_str();
            if by_name.insert(name, id).is_some() {
                return Err(QueueError::DuplicateJob(name));
            }
            let handler = handler.ok_or(QueueError::MissingHandler(name))?;
            jobs.insert(id, RegisteredJob { priority, handler });
        }

        let generator = self
            .generator
            .unwrap_or_else(|| Arc::new(CounterGenerator::new()));

        Ok(Queue {
            backend,
            jobs,
            by_name,
            generator,
        })
    }
}

/// A set of registered jobs bound to one backend.
pub struct Queue<J: JobKey> {
    backend: Arc<dyn Backend>,
    jobs: HashMap<J, RegisteredJob<J>>,
    by_name: HashMap<&'static str, J>,
    generator: Arc<dyn TaskIdGenerator>,
}

impl<J: JobKey> Queue<J> {
    pub fn builder() -> QueueBuilder<J> {
        QueueBuilder::new()
    }

    /// Submits a task and returns its id. Nothing is stored when the job is not
    /// registered with this queue.
    pub async fn enqueue(&self, ctx: &CancellationToken, task: NewTask<J>) -> Result<String> {
        let registered = self
            .jobs
            .get(&task.job)
            .ok_or_else(|| QueueError::UnknownJob(task.job.as_str().to_string()))?;

        let task_id = match task.task_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = self.generator.next_id();
                if id.is_empty() {
                    return Err(QueueError::EmptyTaskId);
                }
                id
            }
        };

        let entry = QueueEntry {
            job_id: task.job.as_str().to_string(),
            task_id: task_id.clone(),
            payload: task.payload,
            priority: task.priority.unwrap_or(registered.priority),
        };

        self.backend.enqueue(ctx, entry).await?;
        debug!("Enqueued task {} for job {}", task_id, task.job.as_str());
        Ok(task_id)
    }

    /// Maps a stored job name back to its identifier.
    pub fn resolve(&self, job_id: &str) -> Option<J> {
        self.by_name.get(job_id).copied()
    }

    pub(crate) fn handler(&self, job: J) -> Option<Arc<dyn JobHandler<J>>> {
        self.jobs.get(&job).map(|registered| registered.handler.clone())
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub async fn force_flush(&self, ctx: &CancellationToken) -> Result<()> {
        self.backend.force_flush(ctx).await
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}

impl<J: JobKey> fmt::Debug for Queue<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("Queue").field("jobs", &names).finish()
    }
}
