//! In-process coordination state.
//!
//! Mirrors [`RedisStateStore`](super::RedisStateStore) semantics (TTL expiry,
//! single-slot commands, capped log) without a server. Only usable when every
//! participant lives in the same process, i.e. tests and local dry runs.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::orchestrator::{ControlCommand, MasterRegistration};
use crate::pool::{Heartbeat, WorkerRecord};

use super::StateStore;

#[derive(Default)]
struct Inner {
    heartbeats: HashMap<String, (Heartbeat, Instant)>,
    workers: HashMap<String, WorkerRecord>,
    master: Option<(MasterRegistration, Instant)>,
    command: Option<String>,
    logs: VecDeque<String>,
    metrics: Option<String>,
}

/// In-memory implementation of [`StateStore`].
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a raw command payload, bypassing serialization.
    pub async fn put_raw_command(&self, raw: impl Into<String>) {
        self.inner.lock().await.command = Some(raw.into());
    }

    /// Returns every mirrored log line, oldest first.
    pub async fn log_lines(&self) -> Vec<String> {
        self.inner.lock().await.logs.iter().cloned().collect()
    }

    /// Returns the last published metrics text.
    pub async fn metrics_text(&self) -> Option<String> {
        self.inner.lock().await.metrics.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn write_heartbeat(&self, heartbeat: &Heartbeat, ttl: Duration) -> Result<(), StoreError> {
        let expires = Instant::now() + ttl;
        self.inner
            .lock()
            .await
            .heartbeats
            .insert(heartbeat.worker_id.clone(), (heartbeat.clone(), expires));
        Ok(())
    }

    async fn read_heartbeat(&self, worker_id: &str) -> Result<Option<Heartbeat>, StoreError> {
        let mut inner = self.inner.lock().await;
        let expired = matches!(inner.heartbeats.get(worker_id), Some((_, exp)) if *exp <= Instant::now());
        if expired {
            inner.heartbeats.remove(worker_id);
            return Ok(None);
        }
        Ok(inner.heartbeats.get(worker_id).map(|(hb, _)| hb.clone()))
    }

    async fn clear_heartbeat(&self, worker_id: &str) -> Result<(), StoreError> {
        self.inner.lock().await.heartbeats.remove(worker_id);
        Ok(())
    }

    async fn save_worker(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .workers
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        self.inner.lock().await.workers.remove(worker_id);
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<WorkerRecord> = inner.workers.values().cloned().collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }

    async fn publish_master(
        &self,
        registration: &MasterRegistration,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.inner.lock().await.master = Some((registration.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn read_master(&self) -> Result<Option<MasterRegistration>, StoreError> {
        let mut inner = self.inner.lock().await;
        if matches!(&inner.master, Some((_, exp)) if *exp <= Instant::now()) {
            inner.master = None;
        }
        Ok(inner.master.as_ref().map(|(reg, _)| reg.clone()))
    }

    async fn clear_master(&self, pid: u32, hostname: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let owned = matches!(&inner.master, Some((reg, _)) if reg.pid == pid && reg.hostname == hostname);
        if owned {
            inner.master = None;
        }
        Ok(owned)
    }

    async fn submit_command(&self, command: &ControlCommand) -> Result<bool, StoreError> {
        let serialized = serde_json::to_string(command)?;
        let mut inner = self.inner.lock().await;
        if inner.command.is_some() {
            return Ok(false);
        }
        inner.command = Some(serialized);
        Ok(true)
    }

    async fn take_command(&self) -> Result<Option<ControlCommand>, StoreError> {
        let raw = self.inner.lock().await.command.take();
        match raw {
            Some(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| StoreError::CorruptRecord {
                    key: "command".to_string(),
                    reason: format!("{}: {}", e, data),
                }),
            None => Ok(None),
        }
    }

    async fn append_log(&self, line: &str, history: usize) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.logs.push_back(line.to_string());
        while inner.logs.len() > history.max(1) {
            inner.logs.pop_front();
        }
        Ok(())
    }

    async fn latest_log(&self) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.logs.back().cloned())
    }

    async fn publish_metrics(&self, text: &str) -> Result<(), StoreError> {
        self.inner.lock().await.metrics = Some(text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::MasterState;
    use crate::pool::WorkerType;

    #[tokio::test]
    async fn test_heartbeat_expires() {
        let store = MemoryStateStore::new();
        let hb = Heartbeat::now("monitoring-1", WorkerType::Monitoring, 10, "host", 0);

        store
            .write_heartbeat(&hb, Duration::from_millis(20))
            .await
            .expect("write");
        assert!(store.read_heartbeat("monitoring-1").await.expect("read").is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.read_heartbeat("monitoring-1").await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_single_pending_command() {
        let store = MemoryStateStore::new();

        assert!(store.submit_command(&ControlCommand::Stop).await.expect("submit"));
        assert!(!store
            .submit_command(&ControlCommand::ClearQueue)
            .await
            .expect("submit"));

        assert_eq!(
            store.take_command().await.expect("take"),
            Some(ControlCommand::Stop)
        );
        assert_eq!(store.take_command().await.expect("take"), None);
    }

    #[tokio::test]
    async fn test_malformed_command_is_consumed() {
        let store = MemoryStateStore::new();
        store.put_raw_command("{\"action\":\"explode\"}").await;

        assert!(matches!(
            store.take_command().await,
            Err(StoreError::CorruptRecord { .. })
        ));
        assert_eq!(store.take_command().await.expect("take"), None);
    }

    #[tokio::test]
    async fn test_log_is_capped() {
        let store = MemoryStateStore::new();
        for i in 0..5 {
            store.append_log(&format!("line {}", i), 3).await.expect("append");
        }

        assert_eq!(store.log_lines().await, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(store.latest_log().await.expect("latest").as_deref(), Some("line 4"));
    }

    #[tokio::test]
    async fn test_clear_master_checks_owner() {
        let store = MemoryStateStore::new();
        let reg = MasterRegistration::new("host-a", chrono::Utc::now(), MasterState::Running);
        store
            .publish_master(&reg, Duration::from_secs(60))
            .await
            .expect("publish");

        assert!(!store.clear_master(reg.pid, "host-b").await.expect("clear"));
        assert!(store.read_master().await.expect("read").is_some());

        assert!(store.clear_master(reg.pid, "host-a").await.expect("clear"));
        assert!(store.read_master().await.expect("read").is_none());
    }
}
