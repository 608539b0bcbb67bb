//! Read-only status surface for dashboards and operators.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::orchestrator::{MasterRegistration, MasterState};
use crate::pool::{WorkerRecord, WorkerStatus, WorkerType};
use crate::queue::TaskQueue;
use crate::store::StateStore;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub master: MasterStatus,
    pub workers: WorkersStatus,
    pub queue: QueueStatus,
    pub latest_log: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MasterStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub hostname: Option<String>,
    pub state: Option<MasterState>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

impl From<Option<MasterRegistration>> for MasterStatus {
    fn from(registration: Option<MasterRegistration>) -> Self {
        match registration {
            Some(reg) => Self {
                running: reg.state == MasterState::Running,
                pid: Some(reg.pid),
                hostname: Some(reg.hostname),
                state: Some(reg.state),
                started_at: Some(reg.started_at),
                last_update: Some(reg.last_update),
            },
            None => Self {
                running: false,
                pid: None,
                hostname: None,
                state: None,
                started_at: None,
                last_update: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkersStatus {
    /// Registered workers that have not been stopped.
    pub active: usize,
    pub by_type: BTreeMap<WorkerType, usize>,
    pub list: Vec<WorkerRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Ready plus delayed tasks.
    pub pending: u64,
    pub claimed: u64,
    /// Dead-lettered tasks.
    pub failed: u64,
    pub pending_by_type: BTreeMap<String, u64>,
}

/// Collects master, worker and queue status from the shared store.
pub async fn build_status(
    store: &dyn StateStore,
    queue: &dyn TaskQueue,
) -> anyhow::Result<StatusReport> {
    let master = MasterStatus::from(store.read_master().await?);

    let list = store.list_workers().await?;
    let mut by_type = BTreeMap::new();
    for record in list.iter().filter(|r| r.status != WorkerStatus::Stopped) {
        *by_type.entry(record.worker_type).or_insert(0) += 1;
    }
    let workers = WorkersStatus {
        active: by_type.values().sum(),
        by_type,
        list,
    };

    let stats = queue.stats().await?;
    let queue = QueueStatus {
        pending: stats.pending + stats.delayed,
        claimed: stats.claimed,
        failed: stats.dead,
        pending_by_type: stats.pending_by_type,
    };

    Ok(StatusReport {
        master,
        workers,
        queue,
        latest_log: store.latest_log().await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryTaskQueue;
    use crate::store::MemoryStateStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_status_without_master() {
        let store = MemoryStateStore::new();
        let queue = MemoryTaskQueue::new();

        let status = build_status(&store, &queue).await.expect("status");
        assert!(!status.master.running);
        assert_eq!(status.workers.active, 0);
        assert_eq!(status.queue.pending, 0);
    }

    #[tokio::test]
    async fn test_status_fields() {
        let store = MemoryStateStore::new();
        let queue = MemoryTaskQueue::new().with_max_attempts(1);

        let registration = MasterRegistration::new("host-a", Utc::now(), MasterState::Running);
        store
            .publish_master(&registration, Duration::from_secs(60))
            .await
            .expect("publish");
        store
            .save_worker(&WorkerRecord::new("campaign-1", WorkerType::Campaign, 10, "host-a"))
            .await
            .expect("save");

        queue.enqueue("campaign", serde_json::json!({})).await.expect("enqueue");
        queue.enqueue("campaign", serde_json::json!({})).await.expect("enqueue");
        let task = queue
            .claim("campaign", "campaign-1", Duration::from_secs(30))
            .await
            .expect("claim")
            .expect("task");
        queue.fail(&task.id, "campaign-1", "no answer").await.expect("fail");

        let status = build_status(&store, &queue).await.expect("status");
        assert!(status.master.running);
        assert_eq!(status.master.hostname.as_deref(), Some("host-a"));
        assert_eq!(status.workers.active, 1);
        assert_eq!(status.queue.pending, 1);
        assert_eq!(status.queue.failed, 1);

        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json["master"]["running"], true);
        assert_eq!(json["workers"]["by_type"]["campaign"], 1);
    }
}
