//! Durable task queue with visibility timeouts and retry backoff.
//!
//! Tasks are claimed by workers of a matching type. A claim hides the task for
//! a visibility timeout; if the worker neither acks nor fails it in time, the
//! master's orphan sweep treats the claim as a failed attempt. Failed tasks
//! come back after an exponential backoff until `max_attempts` is reached,
//! after which they move to the dead set and stay there for inspection.
//!
//! Within one task type, claims follow enqueue order. A retried task keeps
//! its original position, so it is served ahead of tasks enqueued after it
//! once its backoff has elapsed.
//!
//! Delivery is at-least-once: a worker that stalls past its visibility
//! timeout may run a task that is also redelivered elsewhere. Consumers
//! de-duplicate on [`Task::id`].

pub mod memory;
pub mod redis;
pub mod task;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StoreError;

pub use self::memory::MemoryTaskQueue;
pub use self::redis::RedisTaskQueue;
pub use self::task::{RetryPolicy, Task, TaskState, DEFAULT_MAX_ATTEMPTS};

pub(crate) use self::task::RetrySettings;

/// How long completed task records are kept for inspection.
pub const COMPLETED_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store failed or timed out.
    #[error("Queue store error: {0}")]
    Store(#[from] StoreError),

    /// Failed to serialize task data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// A task record could not be decoded.
    #[error("Task {id} is corrupt: {reason}")]
    CorruptTask { id: String, reason: String },

    /// Task types must be non-empty and free of key separators.
    #[error("Invalid task type '{0}'")]
    InvalidTaskType(String),
}

/// Queue depth counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks ready to be claimed now.
    pub pending: u64,
    /// Tasks waiting out a retry backoff.
    pub delayed: u64,
    /// Tasks currently claimed by a worker.
    pub claimed: u64,
    /// Tasks that exhausted their attempts.
    pub dead: u64,
    /// Ready tasks per type.
    pub pending_by_type: BTreeMap<String, u64>,
}

impl QueueStats {
    /// Tasks that will still be delivered, ready or not.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.delayed + self.claimed
    }
}

/// Durable, typed work queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Attempts given to tasks enqueued without an explicit limit.
    fn default_max_attempts(&self) -> u32 {
        DEFAULT_MAX_ATTEMPTS
    }

    /// Replaces the backoff used by later failures and the default attempt
    /// limit of later enqueues. Tasks already enqueued keep their limit.
    fn configure_retries(&self, retry: RetryPolicy, max_attempts: u32);

    /// Enqueues a task with an explicit attempt limit and returns its id.
    async fn enqueue_with_attempts(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Result<String, QueueError>;

    /// Enqueues a task and returns its id.
    async fn enqueue(&self, task_type: &str, payload: serde_json::Value) -> Result<String, QueueError> {
        let attempts = self.default_max_attempts();
        self.enqueue_with_attempts(task_type, payload, attempts).await
    }

    /// Claims the oldest visible task of `task_type`.
    ///
    /// The task stays invisible to other claimants for `visibility_timeout`.
    async fn claim(
        &self,
        task_type: &str,
        claimant: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Task>, QueueError>;

    /// Marks a task claimed by `claimant` completed. Returns false if the
    /// task is not currently claimed by `claimant` (already settled,
    /// recovered, or re-claimed by another worker).
    async fn ack(&self, task_id: &str, claimant: &str) -> Result<bool, QueueError>;

    /// Records a failed attempt by `claimant`. The task is rescheduled with
    /// backoff or, when attempts are exhausted, moved to the dead set.
    /// Returns false if the task is not currently claimed by `claimant`.
    async fn fail(&self, task_id: &str, claimant: &str, reason: &str) -> Result<bool, QueueError>;

    /// Makes every task whose retry backoff has elapsed claimable again.
    /// Returns the number of tasks moved.
    async fn process_retries(&self) -> Result<usize, QueueError>;

    /// Fails every claim whose visibility deadline passed more than `grace`
    /// ago. Returns the number of tasks recovered.
    async fn recover_orphans(&self, grace: Duration) -> Result<usize, QueueError>;

    /// Drops every pending, delayed and claimed task. Dead tasks are kept.
    /// Returns the number of tasks removed.
    async fn clear(&self) -> Result<usize, QueueError>;

    /// Current depth counters.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Most recently dead-lettered tasks, newest first.
    async fn dead_tasks(&self, limit: usize) -> Result<Vec<Task>, QueueError>;

    /// Looks up a task by id.
    async fn get(&self, task_id: &str) -> Result<Option<Task>, QueueError>;
}

pub(crate) fn check_task_type(task_type: &str) -> Result<(), QueueError> {
    if task_type.is_empty() || task_type.contains(':') || task_type.contains(char::is_whitespace) {
        return Err(QueueError::InvalidTaskType(task_type.to_string()));
    }
    Ok(())
}
