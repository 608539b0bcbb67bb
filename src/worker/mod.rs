//! Worker process runtime.
//!
//! A worker is started by the master with `--id` and `--type`. It writes a
//! heartbeat every `heartbeat_interval`, claims tasks of its own type,
//! hands them to a [`TaskHandler`] and acks or fails them. Cancelling the
//! token (SIGTERM, ctrl-c) lets the current task finish and then exits.

pub mod handler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::StoreError;
use crate::pool::{Heartbeat, WorkerType};
use crate::queue::{QueueError, Task, TaskQueue};
use crate::store::StateStore;

pub use handler::{LoggingHandler, TaskHandler};

/// Errors that end a worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The worker id is unusable as a key component.
    #[error("Invalid worker id '{0}'")]
    InvalidId(String),
}

/// Timing of a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Interval between heartbeat writes.
    pub heartbeat_interval: Duration,
    /// Expiry of each heartbeat record.
    pub heartbeat_ttl: Duration,
    /// How long a claimed task stays hidden; also bounds one handler call.
    pub visibility_timeout: Duration,
    /// Sleep after an empty claim.
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(600),
            visibility_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            heartbeat_interval: config.worker_heartbeat_interval,
            heartbeat_ttl: config.worker_timeout * 2,
            visibility_timeout: config.visibility_timeout,
            poll_interval: config.tick_interval,
        }
    }
}

/// Counters reported when a worker exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub processed: u64,
    pub failed: u64,
}

/// One worker process.
pub struct WorkerRuntime {
    id: String,
    worker_type: WorkerType,
    hostname: String,
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn StateStore>,
    handler: Arc<dyn TaskHandler>,
    settings: WorkerSettings,
    cancel: CancellationToken,
    processed: Arc<AtomicU64>,
    failed: u64,
}

impl WorkerRuntime {
    pub fn new(
        id: impl Into<String>,
        worker_type: WorkerType,
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn StateStore>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, WorkerError> {
        let id = id.into();
        if id.is_empty() || id.contains(char::is_whitespace) {
            return Err(WorkerError::InvalidId(id));
        }
        Ok(Self {
            id,
            worker_type,
            hostname: crate::pool::local_hostname(),
            queue,
            store,
            handler,
            settings: WorkerSettings::default(),
            cancel: CancellationToken::new(),
            processed: Arc::new(AtomicU64::new(0)),
            failed: 0,
        })
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs until the token is cancelled.
    ///
    /// Store and queue failures are logged and retried after `poll_interval`;
    /// they never end the worker on their own.
    pub async fn run(mut self) -> Result<WorkerSummary, WorkerError> {
        info!(worker_id = %self.id, worker_type = %self.worker_type, "Worker started");

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.store.clone(),
            self.id.clone(),
            self.worker_type,
            self.hostname.clone(),
            self.settings.heartbeat_interval,
            self.settings.heartbeat_ttl,
            self.processed.clone(),
            self.cancel.clone(),
        ));

        while !self.cancel.is_cancelled() {
            match self
                .queue
                .claim(self.worker_type.as_str(), &self.id, self.settings.visibility_timeout)
                .await
            {
                Ok(Some(task)) => {
                    self.process(task).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(worker_id = %self.id, error = %e, "Failed to claim task"),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        if let Err(e) = heartbeat.await {
            error!(worker_id = %self.id, error = %e, "Heartbeat task panicked");
        }
        if let Err(e) = self.store.clear_heartbeat(&self.id).await {
            debug!(worker_id = %self.id, error = %e, "Failed to clear heartbeat");
        }

        let summary = WorkerSummary {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed,
        };
        info!(
            worker_id = %self.id,
            processed = summary.processed,
            failed = summary.failed,
            "Worker stopped"
        );
        Ok(summary)
    }

    async fn process(&mut self, task: Task) {
        debug!(worker_id = %self.id, task_id = %task.id, attempt = task.attempts + 1, "Claimed task");

        let outcome = match tokio::time::timeout(self.settings.visibility_timeout, self.handler.handle(&task)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!(
                "handler exceeded visibility timeout of {:?}",
                self.settings.visibility_timeout
            )),
        };

        self.processed.fetch_add(1, Ordering::Relaxed);
        let result = match &outcome {
            Ok(()) => self.queue.ack(&task.id, &self.id).await,
            Err(reason) => {
                self.failed += 1;
                warn!(worker_id = %self.id, task_id = %task.id, reason = %reason, "Task failed");
                self.queue.fail(&task.id, &self.id, reason).await
            }
        };

        match result {
            Ok(true) => {}
            // The claim expired and the orphan sweep got there first.
            Ok(false) => warn!(worker_id = %self.id, task_id = %task.id, "Task was no longer claimed"),
            Err(e) => error!(worker_id = %self.id, task_id = %task.id, error = %e, "Failed to settle task"),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn heartbeat_loop(
    store: Arc<dyn StateStore>,
    worker_id: String,
    worker_type: WorkerType,
    hostname: String,
    interval: Duration,
    ttl: Duration,
    processed: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let pid = std::process::id();
    loop {
        let heartbeat = Heartbeat::now(
            worker_id.clone(),
            worker_type,
            pid,
            hostname.clone(),
            processed.load(Ordering::Relaxed),
        );
        if let Err(e) = store.write_heartbeat(&heartbeat, ttl).await {
            warn!(worker_id = %worker_id, error = %e, "Failed to write heartbeat");
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryTaskQueue, TaskState};
    use crate::store::MemoryStateStore;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
        fail_with: Option<String>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn handle(&self, task: &Task) -> anyhow::Result<()> {
            self.seen.lock().await.push(task.id.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.fail_with {
                Some(reason) => Err(anyhow::anyhow!("{}", reason)),
                None => Ok(()),
            }
        }
    }

    fn fast_settings() -> WorkerSettings {
        WorkerSettings {
            heartbeat_interval: Duration::from_millis(10),
            heartbeat_ttl: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
        }
    }

    async fn run_for(runtime: WorkerRuntime, duration: Duration) -> WorkerSummary {
        let token = runtime.cancellation_token();
        let handle = tokio::spawn(runtime.run());
        tokio::time::sleep(duration).await;
        token.cancel();
        handle.await.expect("join").expect("run")
    }

    #[tokio::test]
    async fn test_processes_own_type_in_order() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let store = Arc::new(MemoryStateStore::new());
        let handler = Arc::new(RecordingHandler::default());

        let first = queue.enqueue("campaign", serde_json::json!({"n": 1})).await.expect("enqueue");
        let second = queue.enqueue("campaign", serde_json::json!({"n": 2})).await.expect("enqueue");
        queue.enqueue("statistics", serde_json::json!({})).await.expect("enqueue");

        let runtime = WorkerRuntime::new("campaign-1", WorkerType::Campaign, queue.clone(), store, handler.clone())
            .expect("runtime")
            .with_settings(fast_settings());
        let summary = run_for(runtime, Duration::from_millis(60)).await;

        assert_eq!(summary.processed, 2);
        assert_eq!(*handler.seen.lock().await, vec![first.clone(), second]);
        assert_eq!(
            queue.get(&first).await.expect("get").expect("task").state,
            TaskState::Completed
        );
        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.pending_by_type.get("statistics"), Some(&1));
    }

    #[tokio::test]
    async fn test_handler_error_fails_task() {
        let queue = Arc::new(MemoryTaskQueue::new().with_max_attempts(1));
        let store = Arc::new(MemoryStateStore::new());
        let handler = Arc::new(RecordingHandler {
            fail_with: Some("line busy".to_string()),
            ..Default::default()
        });
        let id = queue.enqueue("campaign", serde_json::json!({})).await.expect("enqueue");

        let runtime = WorkerRuntime::new("campaign-1", WorkerType::Campaign, queue.clone(), store, handler)
            .expect("runtime")
            .with_settings(fast_settings());
        let summary = run_for(runtime, Duration::from_millis(40)).await;

        assert_eq!(summary.failed, 1);
        let task = queue.get(&id).await.expect("get").expect("task");
        assert_eq!(task.state, TaskState::Dead);
        assert_eq!(task.last_error.as_deref(), Some("line busy"));
    }

    #[tokio::test]
    async fn test_slow_handler_is_cut_off() {
        let queue = Arc::new(MemoryTaskQueue::new().with_max_attempts(1));
        let store = Arc::new(MemoryStateStore::new());
        let handler = Arc::new(RecordingHandler {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let id = queue.enqueue("monitoring", serde_json::json!({})).await.expect("enqueue");

        let settings = WorkerSettings {
            visibility_timeout: Duration::from_millis(20),
            ..fast_settings()
        };
        let runtime = WorkerRuntime::new("monitoring-1", WorkerType::Monitoring, queue.clone(), store, handler)
            .expect("runtime")
            .with_settings(settings);
        run_for(runtime, Duration::from_millis(80)).await;

        let task = queue.get(&id).await.expect("get").expect("task");
        assert_eq!(task.state, TaskState::Dead);
        assert!(task
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("visibility timeout")));
    }

    #[tokio::test]
    async fn test_heartbeat_written_and_cleared() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let store = Arc::new(MemoryStateStore::new());
        let runtime = WorkerRuntime::new(
            "statistics-1",
            WorkerType::Statistics,
            queue,
            store.clone(),
            Arc::new(LoggingHandler::new(WorkerType::Statistics)),
        )
        .expect("runtime")
        .with_settings(fast_settings());

        let token = runtime.cancellation_token();
        let handle = tokio::spawn(runtime.run());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let heartbeat = store
            .read_heartbeat("statistics-1")
            .await
            .expect("read")
            .expect("heartbeat present");
        assert_eq!(heartbeat.worker_type, WorkerType::Statistics);
        assert_eq!(heartbeat.pid, std::process::id());

        token.cancel();
        handle.await.expect("join").expect("run");
        assert!(store.read_heartbeat("statistics-1").await.expect("read").is_none());
    }

    #[test]
    fn test_invalid_id_rejected() {
        let result = WorkerRuntime::new(
            "",
            WorkerType::Campaign,
            Arc::new(MemoryTaskQueue::new()),
            Arc::new(MemoryStateStore::new()),
            Arc::new(LoggingHandler::new(WorkerType::Campaign)),
        );
        assert!(matches!(result, Err(WorkerError::InvalidId(_))));
    }

    #[test]
    fn test_settings_from_config() {
        let config = OrchestratorConfig::default();
        let settings = WorkerSettings::from_config(&config);
        assert_eq!(settings.heartbeat_ttl, Duration::from_secs(600));
        assert_eq!(settings.visibility_timeout, config.visibility_timeout);
    }
}
