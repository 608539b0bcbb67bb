//! Task handlers executed by worker processes.

use async_trait::async_trait;
use tracing::info;

use crate::pool::WorkerType;
use crate::queue::Task;

/// Executes claimed tasks.
///
/// Delivery is at-least-once, so implementations must tolerate seeing the
/// same [`Task::id`] twice. An `Err` fails the attempt and its message is kept
/// as the task's `last_error`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> anyhow::Result<()>;
}

/// Handler that only records the task. Used when no dialing backend is
/// attached to the worker binary.
#[derive(Debug, Clone, Copy)]
pub struct LoggingHandler {
    worker_type: WorkerType,
}

impl LoggingHandler {
    pub fn new(worker_type: WorkerType) -> Self {
        Self { worker_type }
    }
}

#[async_trait]
impl TaskHandler for LoggingHandler {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        info!(
            worker_type = %self.worker_type,
            task_id = %task.id,
            attempt = task.attempts + 1,
            payload = %task.payload,
            "Handled task"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_handler_accepts_everything() {
        let handler = LoggingHandler::new(WorkerType::Statistics);
        let task = Task::new("t-1", "statistics", serde_json::json!({"day": "2024-03-01"}), 3, 1);
        assert!(handler.handle(&task).await.is_ok());
    }
}
