/// A task as handed to a backend: the job identifier is already resolved to its
/// stored name and the priority to a concrete value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: String,
    pub task_id: String,
    pub payload: Vec<u8>,
    pub priority: i64,
}

/// A task claimed by `Backend::dequeue`. It stays in flight until acked or nacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: String,
    pub task_id: String,
    pub payload: Vec<u8>,
}

impl From<QueueEntry> for Delivery {
    fn from(entry: QueueEntry) -> Self {
        Self {
            job_id: entry.job_id,
            task_id: entry.task_id,
            payload: entry.payload,
        }
    }
}
