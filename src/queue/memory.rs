//! In-process task queue with the same transitions as the Redis backend.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    check_task_type, QueueError, QueueStats, RetryPolicy, RetrySettings, Task, TaskQueue, TaskState,
    COMPLETED_RETENTION,
};

#[derive(Default)]
struct Inner {
    seq: u64,
    tasks: HashMap<String, Task>,
    ready: HashMap<String, BTreeMap<u64, String>>,
    delayed: HashMap<String, DateTime<Utc>>,
    claimed: HashMap<String, DateTime<Utc>>,
    dead: VecDeque<String>,
    /// Completed ids in completion order.
    completed: VecDeque<(DateTime<Utc>, String)>,
}

enum FailOutcome {
    Retry,
    Dead,
    NotClaimed,
}

impl Inner {
    /// Whether `task_id` is claimed, and by `claimant` when one is given.
    fn holds_claim(&self, task_id: &str, claimant: Option<&str>) -> bool {
        if !self.claimed.contains_key(task_id) {
            return false;
        }
        match claimant {
            Some(claimant) => self
                .tasks
                .get(task_id)
                .is_some_and(|t| t.claimed_by.as_deref() == Some(claimant)),
            None => true,
        }
    }

    fn fail(
        &mut self,
        task_id: &str,
        claimant: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
        retry: &RetryPolicy,
    ) -> FailOutcome {
        if !self.holds_claim(task_id, claimant) {
            return FailOutcome::NotClaimed;
        }
        self.claimed.remove(task_id);
        let Some(task) = self.tasks.get_mut(task_id) else {
            return FailOutcome::NotClaimed;
        };

        task.attempts += 1;
        task.last_error = Some(reason.to_string());
        if task.should_retry() {
            let delay = chrono::Duration::from_std(retry.backoff(task.attempts))
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
            task.state = TaskState::Pending;
            task.visible_at = now + delay;
            task.claimed_by = None;
            task.claimed_at = None;
            self.delayed.insert(task_id.to_string(), task.visible_at);
            FailOutcome::Retry
        } else {
            task.state = TaskState::Dead;
            task.finished_at = Some(now);
            self.dead.push_front(task_id.to_string());
            FailOutcome::Dead
        }
    }

    /// Forgets completed tasks finished before `cutoff`.
    fn evict_completed(&mut self, cutoff: DateTime<Utc>) {
        while let Some((finished_at, _)) = self.completed.front() {
            if *finished_at > cutoff {
                break;
            }
            if let Some((_, id)) = self.completed.pop_front() {
                self.tasks.remove(&id);
            }
        }
    }
}

/// In-memory implementation of [`TaskQueue`].
pub struct MemoryTaskQueue {
    inner: Mutex<Inner>,
    retry: RetrySettings,
    retention: Duration,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self {
            inner: Mutex::default(),
            retry: RetrySettings::default(),
            retention: COMPLETED_RETENTION,
        }
    }
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long completed tasks stay visible through `get`.
    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::days(365))
    }

    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        let max_attempts = self.retry.max_attempts();
        self.retry.set(retry, max_attempts);
        self
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        self.retry.set(self.retry.policy(), max_attempts);
        self
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    fn default_max_attempts(&self) -> u32 {
        self.retry.max_attempts()
    }

    fn configure_retries(&self, retry: RetryPolicy, max_attempts: u32) {
        self.retry.set(retry, max_attempts);
    }

    async fn enqueue_with_attempts(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Result<String, QueueError> {
        check_task_type(task_type)?;
        let mut inner = self.inner.lock().await;
        inner.seq += 1;
        let seq = inner.seq;

        let task = Task::new(Uuid::new_v4().to_string(), task_type, payload, max_attempts, seq);
        let id = task.id.clone();
        inner
            .ready
            .entry(task_type.to_string())
            .or_default()
            .insert(seq, id.clone());
        inner.tasks.insert(id.clone(), task);
        Ok(id)
    }

    async fn claim(
        &self,
        task_type: &str,
        claimant: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Task>, QueueError> {
        check_task_type(task_type)?;
        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(365));
        let mut inner = self.inner.lock().await;

        loop {
            let next = inner
                .ready
                .get_mut(task_type)
                .and_then(|ready| ready.pop_first());
            let Some((_, id)) = next else {
                return Ok(None);
            };
            let Some(task) = inner.tasks.get_mut(&id) else {
                continue;
            };

            task.state = TaskState::Claimed;
            task.claimed_by = Some(claimant.to_string());
            task.claimed_at = Some(now);
            task.visible_at = deadline;
            let claimed = task.clone();
            inner.claimed.insert(id, deadline);
            return Ok(Some(claimed));
        }
    }

    async fn ack(&self, task_id: &str, claimant: &str) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        if !inner.holds_claim(task_id, Some(claimant)) {
            return Ok(false);
        }
        inner.claimed.remove(task_id);
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.state = TaskState::Completed;
            task.finished_at = Some(now);
        }
        inner.completed.push_back((now, task_id.to_string()));
        inner.evict_completed(self.retention_cutoff(now));
        Ok(true)
    }

    async fn fail(&self, task_id: &str, claimant: &str, reason: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let outcome = inner.fail(task_id, Some(claimant), reason, Utc::now(), &self.retry.policy());
        Ok(!matches!(outcome, FailOutcome::NotClaimed))
    }

    async fn process_retries(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.evict_completed(self.retention_cutoff(now));

        let due: Vec<String> = inner
            .delayed
            .iter()
            .filter(|(_, visible_at)| **visible_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut moved = 0;
        for id in due {
            inner.delayed.remove(&id);
            let Some((task_type, seq)) = inner.tasks.get(&id).map(|t| (t.task_type.clone(), t.seq)) else {
                continue;
            };
            inner.ready.entry(task_type).or_default().insert(seq, id);
            moved += 1;
        }
        Ok(moved)
    }

    async fn recover_orphans(&self, grace: Duration) -> Result<usize, QueueError> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        let retry = self.retry.policy();
        let mut inner = self.inner.lock().await;

        let expired: Vec<String> = inner
            .claimed
            .iter()
            .filter(|(_, deadline)| **deadline <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        let mut recovered = 0;
        for id in expired {
            if !matches!(
                inner.fail(&id, None, "visibility timeout expired", now, &retry),
                FailOutcome::NotClaimed
            ) {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn clear(&self) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().await;
        let mut doomed: Vec<String> = inner
            .ready
            .drain()
            .flat_map(|(_, ids)| ids.into_values())
            .collect();
        doomed.extend(inner.delayed.drain().map(|(id, _)| id));
        doomed.extend(inner.claimed.drain().map(|(id, _)| id));

        for id in &doomed {
            inner.tasks.remove(id);
        }
        Ok(doomed.len())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats::default();
        for (task_type, ids) in &inner.ready {
            let count = ids.len() as u64;
            stats.pending += count;
            stats.pending_by_type.insert(task_type.clone(), count);
        }
        stats.delayed = inner.delayed.len() as u64;
        stats.claimed = inner.claimed.len() as u64;
        stats.dead = inner.dead.len() as u64;
        Ok(stats)
    }

    async fn dead_tasks(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .dead
            .iter()
            .take(limit)
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect())
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>, QueueError> {
        Ok(self.inner.lock().await.tasks.get(task_id).cloned())
    }
}
