//! Worker pool manager.
//!
//! Owns the master's view of the worker population: which processes exist,
//! of what type, and whether they are still healthy. The manager talks to the
//! OS only through a [`ProcessSupervisor`] and mirrors every record into the
//! shared [`StateStore`] so a successor master can adopt the population.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::StoreError;
use crate::sources::ActiveCampaign;
use crate::store::StateStore;

use super::supervisor::{ProcessSupervisor, SupervisorError};
use super::worker::{WorkerRecord, WorkerStatus, WorkerType};

/// Consecutive spawn failures of one type after which failures are logged
/// at error level.
pub const RESPAWN_ESCALATION_THRESHOLD: u32 = 3;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The process supervisor failed.
    #[error("Process supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Reading heartbeats or mirroring the registry failed.
    #[error("Worker registry error: {0}")]
    Store(#[from] StoreError),

    /// No tracked worker has this id.
    #[error("Worker {0} not found")]
    WorkerNotFound(String),
}

/// Tunables of the pool manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Heartbeat age beyond which a worker is replaced.
    pub worker_timeout: Duration,
    /// Time a new worker has to produce its first heartbeat.
    pub bootstrap_grace: Duration,
    /// Time between the shutdown request and the forced kill.
    pub terminate_grace: Duration,
    /// Upper bound on campaign workers.
    pub max_campaign_workers: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(300),
            bootstrap_grace: Duration::from_secs(60),
            terminate_grace: Duration::from_secs(10),
            max_campaign_workers: 10,
        }
    }
}

impl PoolSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            worker_timeout: config.worker_timeout,
            bootstrap_grace: config.worker_bootstrap_grace,
            terminate_grace: config.terminate_grace,
            max_campaign_workers: config.max_campaign_workers,
        }
    }
}

/// Desired or current number of workers per type.
pub type WorkerCounts = BTreeMap<WorkerType, usize>;

/// A single step of a reconciliation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAction {
    Spawn(WorkerType),
    Stop(WorkerType),
}

/// Computes the actions that move `current` to `desired`.
///
/// Spawns come first, in [`WorkerType::ALL`] order; stops follow in reverse
/// type order. Types absent from `desired` are left untouched.
pub fn plan_reconcile(current: &WorkerCounts, desired: &WorkerCounts) -> Vec<PoolAction> {
    let mut actions = Vec::new();
    for worker_type in WorkerType::ALL {
        let Some(&want) = desired.get(&worker_type) else {
            continue;
        };
        let have = current.get(&worker_type).copied().unwrap_or(0);
        actions.extend(std::iter::repeat(PoolAction::Spawn(worker_type)).take(want.saturating_sub(have)));
    }
    for worker_type in WorkerType::ALL.iter().rev() {
        let Some(&want) = desired.get(worker_type) else {
            continue;
        };
        let have = current.get(worker_type).copied().unwrap_or(0);
        actions.extend(std::iter::repeat(PoolAction::Stop(*worker_type)).take(have.saturating_sub(want)));
    }
    actions
}

/// Outcome of one reconcile pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub spawned: Vec<String>,
    pub stopped: Vec<String>,
    /// Types whose spawn failed.
    pub failed: Vec<WorkerType>,
    /// Workers that could not be stopped; they stay tracked.
    pub failed_stops: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.spawned.is_empty() && self.stopped.is_empty() && self.failed.is_empty() && self.failed_stops.is_empty()
    }
}

/// A worker replaced by the health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub worker_type: WorkerType,
    pub old_id: String,
    /// `None` if the respawn failed; reconcile retries on a later tick.
    pub new_id: Option<String>,
    pub reason: String,
}

/// Outcome of one health check pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: usize,
    pub replaced: Vec<Replacement>,
}

/// Outcome of adopting a predecessor's registry.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AdoptReport {
    pub adopted: usize,
    /// Entries of other hosts. Their processes may still run unsupervised.
    pub abandoned: Vec<WorkerRecord>,
}

/// Tracks and manages worker processes.
pub struct WorkerPoolManager {
    supervisor: Arc<dyn ProcessSupervisor>,
    store: Arc<dyn StateStore>,
    settings: PoolSettings,
    hostname: String,
    workers: BTreeMap<String, WorkerRecord>,
    adjustments: HashMap<WorkerType, i64>,
    spawn_failures: HashMap<WorkerType, u32>,
    restarts: HashMap<WorkerType, u64>,
}

impl WorkerPoolManager {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        store: Arc<dyn StateStore>,
        settings: PoolSettings,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            store,
            settings,
            hostname: hostname.into(),
            workers: BTreeMap::new(),
            adjustments: HashMap::new(),
            spawn_failures: HashMap::new(),
            restarts: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Replaces the tunables; takes effect on the next pass.
    pub fn update_settings(&mut self, settings: PoolSettings) {
        self.settings = settings;
    }

    /// Tracked workers, ordered by id.
    pub fn workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerRecord> {
        self.workers.get(worker_id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Consecutive spawn failures for `worker_type` since its last success.
    pub fn spawn_failures(&self, worker_type: WorkerType) -> u32 {
        self.spawn_failures.get(&worker_type).copied().unwrap_or(0)
    }

    /// Workers replaced by the health check since startup.
    pub fn restarts(&self, worker_type: WorkerType) -> u64 {
        self.restarts.get(&worker_type).copied().unwrap_or(0)
    }

    /// Operator adjustment applied on top of the computed target.
    pub fn adjustment(&self, worker_type: WorkerType) -> i64 {
        self.adjustments.get(&worker_type).copied().unwrap_or(0)
    }

    /// Computes target counts from the running campaigns.
    ///
    /// One monitoring and one statistics worker are always wanted. Campaign
    /// workers follow the number of running campaigns, capped by
    /// `max_campaign_workers`. Operator adjustments are added last.
    pub fn desired_counts(&self, campaigns: &[ActiveCampaign]) -> WorkerCounts {
        let campaign_workers = campaigns.len().min(self.settings.max_campaign_workers);
        let base = [
            (WorkerType::Monitoring, 1usize),
            (WorkerType::Statistics, 1),
            (WorkerType::Campaign, campaign_workers),
        ];
        base.into_iter()
            .map(|(worker_type, count)| {
                let adjusted = count as i64 + self.adjustment(worker_type);
                (worker_type, adjusted.max(0) as usize)
            })
            .collect()
    }

    /// Live worker count per type; every type is present.
    pub fn current_counts(&self) -> WorkerCounts {
        let mut counts: WorkerCounts = WorkerType::ALL.iter().map(|t| (*t, 0)).collect();
        for record in self.workers.values() {
            if record.status != WorkerStatus::Stopped {
                *counts.entry(record.worker_type).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Starts or stops workers until the population matches `desired`.
    ///
    /// Spawn and stop failures are recorded in the report and do not stop
    /// the pass. A worker that failed to stop is not picked again in the same
    /// pass; the next older worker of its type is stopped instead.
    pub async fn reconcile(&mut self, desired: &WorkerCounts) -> Result<ReconcileReport, PoolError> {
        let mut report = ReconcileReport::default();

        for action in plan_reconcile(&self.current_counts(), desired) {
            match action {
                PoolAction::Spawn(worker_type) => match self.spawn(worker_type).await {
                    Ok(record) => report.spawned.push(record.id),
                    Err(_) => report.failed.push(worker_type),
                },
                PoolAction::Stop(worker_type) => {
                    let Some(victim) = self.newest_of(worker_type, &report.failed_stops) else {
                        continue;
                    };
                    match self.terminate(&victim).await {
                        Ok(_) => report.stopped.push(victim),
                        Err(e) => {
                            error!(
                                worker_id = %victim,
                                worker_type = %worker_type,
                                error = %e,
                                "Failed to stop excess worker"
                            );
                            report.failed_stops.push(victim);
                        }
                    }
                }
            }
        }

        if !report.is_noop() {
            info!(
                spawned = report.spawned.len(),
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                failed_stops = report.failed_stops.len(),
                "Reconciled worker pool"
            );
        }
        Ok(report)
    }

    fn newest_of(&self, worker_type: WorkerType, skip: &[String]) -> Option<String> {
        self.workers
            .values()
            .filter(|r| r.worker_type == worker_type && r.status != WorkerStatus::Stopped)
            .filter(|r| !skip.contains(&r.id))
            .max_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)))
            .map(|r| r.id.clone())
    }

    /// Starts one worker of `worker_type` and starts tracking it.
    pub async fn spawn(&mut self, worker_type: WorkerType) -> Result<WorkerRecord, PoolError> {
        let worker_id = WorkerRecord::generate_id(worker_type);

        let pid = match self.supervisor.spawn(worker_type, &worker_id).await {
            Ok(pid) => pid,
            Err(e) => {
                let failures = self.spawn_failures.entry(worker_type).or_insert(0);
                *failures += 1;
                if *failures >= RESPAWN_ESCALATION_THRESHOLD {
                    error!(
                        worker_type = %worker_type,
                        consecutive_failures = *failures,
                        error = %e,
                        "Worker spawn keeps failing"
                    );
                } else {
                    warn!(worker_type = %worker_type, error = %e, "Worker spawn failed");
                }
                return Err(e.into());
            }
        };

        self.spawn_failures.remove(&worker_type);
        let record = WorkerRecord::new(worker_id, worker_type, pid, self.hostname.clone());
        self.mirror(&record).await;
        self.workers.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// Stops a worker and forgets it.
    ///
    /// Returns `Ok(false)` for unknown or already stopped workers.
    pub async fn terminate(&mut self, worker_id: &str) -> Result<bool, PoolError> {
        let Some(record) = self.workers.get(worker_id) else {
            return Ok(false);
        };
        if record.status == WorkerStatus::Stopped {
            return Ok(false);
        }
        let pid = record.pid;

        self.supervisor.terminate(pid, self.settings.terminate_grace).await?;

        if let Some(mut record) = self.workers.remove(worker_id) {
            record.status = WorkerStatus::Stopped;
            info!(worker_id = %worker_id, worker_type = %record.worker_type, pid, "Worker terminated");
        }
        if let Err(e) = self.store.remove_worker(worker_id).await {
            warn!(worker_id = %worker_id, error = %e, "Failed to remove worker from registry");
        }
        if let Err(e) = self.store.clear_heartbeat(worker_id).await {
            debug!(worker_id = %worker_id, error = %e, "Failed to clear heartbeat");
        }
        Ok(true)
    }

    /// Stops every tracked worker. Failures are logged and the rest continue.
    pub async fn terminate_all(&mut self) -> usize {
        let ids: Vec<String> = self.workers.keys().cloned().collect();
        let mut stopped = 0;
        for worker_id in ids {
            match self.terminate(&worker_id).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => error!(worker_id = %worker_id, error = %e, "Failed to terminate worker"),
            }
        }
        stopped
    }

    /// Terminates a worker and starts a replacement of the same type.
    pub async fn restart(&mut self, worker_id: &str) -> Result<WorkerRecord, PoolError> {
        let worker_type = self
            .workers
            .get(worker_id)
            .map(|r| r.worker_type)
            .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?;
        self.terminate(worker_id).await?;
        self.spawn(worker_type).await
    }

    /// Spawns an extra worker and raises the target so reconcile keeps it.
    pub async fn add_worker(&mut self, worker_type: WorkerType) -> Result<WorkerRecord, PoolError> {
        let record = self.spawn(worker_type).await?;
        *self.adjustments.entry(worker_type).or_insert(0) += 1;
        Ok(record)
    }

    /// Stops a worker and lowers the target so reconcile does not replace it.
    pub async fn remove_worker(&mut self, worker_id: &str) -> Result<WorkerType, PoolError> {
        let worker_type = self
            .workers
            .get(worker_id)
            .map(|r| r.worker_type)
            .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?;
        self.terminate(worker_id).await?;
        *self.adjustments.entry(worker_type).or_insert(0) -= 1;
        Ok(worker_type)
    }

    /// Whether the process behind `worker_id` is running.
    pub async fn is_alive(&self, worker_id: &str) -> bool {
        match self.workers.get(worker_id) {
            Some(record) => self.supervisor.is_alive(record.pid).await,
            None => false,
        }
    }

    /// Replaces every worker whose heartbeat is stale or whose process died.
    ///
    /// A store failure aborts the pass before any worker is touched, so an
    /// unreachable Redis never looks like a fleet of dead workers.
    pub async fn health_check(&mut self) -> Result<HealthReport, PoolError> {
        let now = Utc::now();
        let mut report = HealthReport::default();
        let ids: Vec<String> = self.workers.keys().cloned().collect();
        let reads = ids.iter().map(|worker_id| self.store.read_heartbeat(worker_id));
        let mut heartbeats: HashMap<String, _> = ids
            .iter()
            .cloned()
            .zip(futures::future::try_join_all(reads).await?)
            .collect();

        for worker_id in ids {
            let Some(record) = self.workers.get_mut(&worker_id) else {
                continue;
            };
            if let Some(Some(heartbeat)) = heartbeats.remove(&worker_id) {
                if record.last_heartbeat.map_or(true, |seen| heartbeat.at > seen) {
                    record.last_heartbeat = Some(heartbeat.at);
                }
            }
            let pid = record.pid;
            let worker_type = record.worker_type;
            let stale = record.is_stale(now, self.settings.worker_timeout, self.settings.bootstrap_grace);
            let had_heartbeat = record.last_heartbeat.is_some();
            let alive = self.supervisor.is_alive(pid).await;

            let reason = match (alive, stale, had_heartbeat) {
                (true, false, _) => None,
                (false, _, _) => Some("process not running".to_string()),
                (true, true, true) => Some("heartbeat stale".to_string()),
                (true, true, false) => Some("no heartbeat within bootstrap grace".to_string()),
            };

            let Some(reason) = reason else {
                let updated = self.workers.get_mut(&worker_id).map(|record| {
                    record.status = WorkerStatus::Active;
                    record.clone()
                });
                if let Some(record) = updated {
                    self.mirror(&record).await;
                }
                report.healthy += 1;
                continue;
            };

            warn!(
                worker_id = %worker_id,
                worker_type = %worker_type,
                pid,
                reason = %reason,
                "Worker unhealthy, replacing"
            );
            if let Some(record) = self.workers.get_mut(&worker_id) {
                record.status = WorkerStatus::Unresponsive;
            }
            if let Err(e) = self.terminate(&worker_id).await {
                error!(worker_id = %worker_id, error = %e, "Failed to terminate unhealthy worker");
                continue;
            }
            *self.restarts.entry(worker_type).or_insert(0) += 1;
            let new_id = self.spawn(worker_type).await.ok().map(|r| r.id);
            report.replaced.push(Replacement {
                worker_type,
                old_id: worker_id,
                new_id,
                reason,
            });
        }
        Ok(report)
    }

    /// Takes over workers left by a previous master on this host.
    ///
    /// Registry entries for other hosts or dead processes are dropped.
    pub async fn adopt_existing(&mut self) -> Result<AdoptReport, PoolError> {
        let mut report = AdoptReport::default();
        for record in self.store.list_workers().await? {
            let local = record.hostname == self.hostname;
            if local && record.status != WorkerStatus::Stopped && self.supervisor.is_alive(record.pid).await {
                debug!(worker_id = %record.id, pid = record.pid, "Adopted worker");
                self.workers.insert(record.id.clone(), record);
                report.adopted += 1;
                continue;
            }

            self.store.remove_worker(&record.id).await?;
            self.store.clear_heartbeat(&record.id).await?;
            if local || record.status == WorkerStatus::Stopped {
                debug!(worker_id = %record.id, pid = record.pid, "Dropped stale registry entry");
            } else {
                warn!(
                    worker_id = %record.id,
                    worker_type = %record.worker_type,
                    pid = record.pid,
                    hostname = %record.hostname,
                    "Dropped worker of another host; its process may still be running"
                );
                report.abandoned.push(record);
            }
        }
        if report.adopted > 0 {
            info!(adopted = report.adopted, "Adopted existing workers");
        }
        Ok(report)
    }

    async fn mirror(&self, record: &WorkerRecord) {
        if let Err(e) = self.store.save_worker(record).await {
            warn!(worker_id = %record.id, error = %e, "Failed to mirror worker record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Heartbeat;
    use crate::store::MemoryStateStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeSupervisor {
        next_pid: AtomicU32,
        alive: Mutex<HashSet<u32>>,
        spawned: Mutex<Vec<(WorkerType, String)>>,
        terminated: Mutex<Vec<u32>>,
        fail_spawns: Mutex<bool>,
        stuck: Mutex<HashSet<u32>>,
    }

    impl FakeSupervisor {
        async fn kill(&self, pid: u32) {
            self.alive.lock().await.remove(&pid);
        }

        /// Makes `terminate` fail for `pid` and leaves the process running.
        async fn refuse_terminate(&self, pid: u32) {
            self.stuck.lock().await.insert(pid);
        }
    }

    #[async_trait]
    impl ProcessSupervisor for FakeSupervisor {
        async fn spawn(&self, worker_type: WorkerType, worker_id: &str) -> Result<u32, SupervisorError> {
            if *self.fail_spawns.lock().await {
                return Err(SupervisorError::ProgramUnavailable("disabled".to_string()));
            }
            let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.alive.lock().await.insert(pid);
            self.spawned.lock().await.push((worker_type, worker_id.to_string()));
            Ok(pid)
        }

        async fn terminate(&self, pid: u32, _grace: Duration) -> Result<(), SupervisorError> {
            if self.stuck.lock().await.contains(&pid) {
                return Err(SupervisorError::TerminateFailed {
                    pid,
                    reason: "operation not permitted".to_string(),
                });
            }
            if self.alive.lock().await.remove(&pid) {
                self.terminated.lock().await.push(pid);
            }
            Ok(())
        }

        async fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().await.contains(&pid)
        }
    }

    fn manager() -> (WorkerPoolManager, Arc<FakeSupervisor>, Arc<MemoryStateStore>) {
        let supervisor = Arc::new(FakeSupervisor::default());
        let store = Arc::new(MemoryStateStore::new());
        let manager = WorkerPoolManager::new(
            supervisor.clone(),
            store.clone(),
            PoolSettings::default(),
            "host-a",
        );
        (manager, supervisor, store)
    }

    fn counts(entries: &[(WorkerType, usize)]) -> WorkerCounts {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_plan_spawns_in_priority_order() {
        let current = counts(&[]);
        let desired = counts(&[
            (WorkerType::Campaign, 1),
            (WorkerType::Statistics, 1),
            (WorkerType::Monitoring, 1),
        ]);
        assert_eq!(
            plan_reconcile(&current, &desired),
            vec![
                PoolAction::Spawn(WorkerType::Monitoring),
                PoolAction::Spawn(WorkerType::Statistics),
                PoolAction::Spawn(WorkerType::Campaign),
            ]
        );
    }

    #[test]
    fn test_plan_leaves_matching_and_unlisted_types() {
        let current = counts(&[(WorkerType::Campaign, 0), (WorkerType::Monitoring, 1), (WorkerType::Statistics, 4)]);
        let desired = counts(&[(WorkerType::Campaign, 2), (WorkerType::Monitoring, 1)]);
        assert_eq!(
            plan_reconcile(&current, &desired),
            vec![PoolAction::Spawn(WorkerType::Campaign), PoolAction::Spawn(WorkerType::Campaign)]
        );
    }

    #[tokio::test]
    async fn test_reconcile_spawns_missing_campaign_workers_only() {
        let (mut manager, supervisor, _) = manager();
        manager.spawn(WorkerType::Monitoring).await.expect("spawn");
        let monitoring_before: Vec<String> = manager.workers().map(|r| r.id.clone()).collect();

        let desired = counts(&[(WorkerType::Campaign, 2), (WorkerType::Monitoring, 1)]);
        let report = manager.reconcile(&desired).await.expect("reconcile");

        assert_eq!(report.spawned.len(), 2);
        assert!(report.stopped.is_empty());
        assert!(supervisor.terminated.lock().await.is_empty());
        assert_eq!(manager.current_counts()[&WorkerType::Campaign], 2);
        assert_eq!(manager.current_counts()[&WorkerType::Monitoring], 1);
        assert!(monitoring_before.iter().all(|id| manager.get(id).is_some()));
    }

    #[tokio::test]
    async fn test_reconcile_stops_newest_first() {
        let (mut manager, _, _) = manager();
        let oldest = manager.spawn(WorkerType::Campaign).await.expect("spawn");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let middle = manager.spawn(WorkerType::Campaign).await.expect("spawn");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newest = manager.spawn(WorkerType::Campaign).await.expect("spawn");

        let report = manager
            .reconcile(&counts(&[(WorkerType::Campaign, 1)]))
            .await
            .expect("reconcile");

        assert_eq!(report.stopped, vec![newest.id.clone(), middle.id.clone()]);
        assert!(manager.get(&oldest.id).is_some());
    }

    #[tokio::test]
    async fn test_desired_counts_caps_campaign_workers() {
        let (mut manager, _, _) = manager();
        manager.update_settings(PoolSettings {
            max_campaign_workers: 2,
            ..PoolSettings::default()
        });
        let campaigns: Vec<ActiveCampaign> = (0..5)
            .map(|i| ActiveCampaign::new(format!("c{}", i), 3, 0))
            .collect();

        let desired = manager.desired_counts(&campaigns);
        assert_eq!(desired[&WorkerType::Monitoring], 1);
        assert_eq!(desired[&WorkerType::Statistics], 1);
        assert_eq!(desired[&WorkerType::Campaign], 2);

        assert_eq!(manager.desired_counts(&[])[&WorkerType::Campaign], 0);
    }

    #[tokio::test]
    async fn test_stale_monitoring_worker_is_respawned() {
        let (mut manager, supervisor, store) = manager();
        let old = manager.spawn(WorkerType::Monitoring).await.expect("spawn");

        // Live pid, heartbeat older than the worker timeout.
        let mut heartbeat = Heartbeat::now(&old.id, WorkerType::Monitoring, old.pid, "host-a", 5);
        heartbeat.at = Utc::now() - chrono::Duration::seconds(301);
        store
            .write_heartbeat(&heartbeat, Duration::from_secs(600))
            .await
            .expect("heartbeat");

        let report = manager.health_check().await.expect("health check");

        assert_eq!(report.replaced.len(), 1);
        assert_eq!(report.replaced[0].old_id, old.id);
        assert!(!supervisor.is_alive(old.pid).await);
        assert!(manager.get(&old.id).is_none());

        let replacement = manager.workers().next().expect("replacement");
        assert_eq!(replacement.worker_type, WorkerType::Monitoring);
        assert!(replacement.started_at > old.started_at);
        assert_eq!(Some(replacement.id.clone()), report.replaced[0].new_id);
        assert_eq!(manager.restarts(WorkerType::Monitoring), 1);
    }

    #[tokio::test]
    async fn test_dead_process_is_respawned() {
        let (mut manager, supervisor, _) = manager();
        let old = manager.spawn(WorkerType::Campaign).await.expect("spawn");
        supervisor.kill(old.pid).await;

        let report = manager.health_check().await.expect("health check");
        assert_eq!(report.replaced.len(), 1);
        assert_eq!(report.replaced[0].reason, "process not running");
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_marks_active() {
        let (mut manager, _, store) = manager();
        let worker = manager.spawn(WorkerType::Statistics).await.expect("spawn");
        let heartbeat = Heartbeat::now(&worker.id, WorkerType::Statistics, worker.pid, "host-a", 0);
        store
            .write_heartbeat(&heartbeat, Duration::from_secs(600))
            .await
            .expect("heartbeat");

        let report = manager.health_check().await.expect("health check");
        assert_eq!(report.healthy, 1);
        assert_eq!(manager.get(&worker.id).map(|r| r.status), Some(WorkerStatus::Active));

        let mirrored = store.list_workers().await.expect("list");
        assert_eq!(mirrored[0].status, WorkerStatus::Active);
    }

    #[tokio::test]
    async fn test_terminate_stopped_worker_is_noop() {
        let (mut manager, supervisor, _) = manager();
        let worker = manager.spawn(WorkerType::Campaign).await.expect("spawn");

        assert!(manager.terminate(&worker.id).await.expect("terminate"));
        assert!(!manager.terminate(&worker.id).await.expect("terminate again"));
        assert!(!manager.terminate("campaign-unknown").await.expect("terminate unknown"));
        assert_eq!(supervisor.terminated.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failures_escalate_and_reset() {
        let (mut manager, supervisor, _) = manager();
        *supervisor.fail_spawns.lock().await = true;
        for _ in 0..RESPAWN_ESCALATION_THRESHOLD {
            assert!(manager.spawn(WorkerType::Campaign).await.is_err());
        }
        assert_eq!(manager.spawn_failures(WorkerType::Campaign), RESPAWN_ESCALATION_THRESHOLD);

        *supervisor.fail_spawns.lock().await = false;
        manager.spawn(WorkerType::Campaign).await.expect("spawn");
        assert_eq!(manager.spawn_failures(WorkerType::Campaign), 0);
    }

    #[tokio::test]
    async fn test_operator_adjustments_survive_reconcile() {
        let (mut manager, _, _) = manager();
        manager.reconcile(&manager.desired_counts(&[])).await.expect("reconcile");
        assert_eq!(manager.len(), 2);

        manager.add_worker(WorkerType::Campaign).await.expect("add");
        let monitoring = manager
            .workers()
            .find(|r| r.worker_type == WorkerType::Monitoring)
            .map(|r| r.id.clone())
            .expect("monitoring worker");
        manager.remove_worker(&monitoring).await.expect("remove");

        let report = manager
            .reconcile(&manager.desired_counts(&[]))
            .await
            .expect("reconcile");
        assert!(report.is_noop());
        assert_eq!(manager.current_counts()[&WorkerType::Campaign], 1);
        assert_eq!(manager.current_counts()[&WorkerType::Monitoring], 0);
    }

    #[tokio::test]
    async fn test_adopt_keeps_live_local_workers() {
        let (mut manager, supervisor, store) = manager();
        let live_pid = supervisor.spawn(WorkerType::Monitoring, "monitoring-live").await.expect("spawn");

        store
            .save_worker(&WorkerRecord::new("monitoring-live", WorkerType::Monitoring, live_pid, "host-a"))
            .await
            .expect("save");
        store
            .save_worker(&WorkerRecord::new("campaign-dead", WorkerType::Campaign, 4242, "host-a"))
            .await
            .expect("save");
        store
            .save_worker(&WorkerRecord::new("campaign-remote", WorkerType::Campaign, live_pid, "host-b"))
            .await
            .expect("save");

        let report = manager.adopt_existing().await.expect("adopt");
        assert_eq!(report.adopted, 1);
        assert!(manager.get("monitoring-live").is_some());
        let abandoned: Vec<(&str, u32)> = report
            .abandoned
            .iter()
            .map(|r| (r.id.as_str(), r.pid))
            .collect();
        assert_eq!(abandoned, vec![("campaign-remote", live_pid)]);

        let registry: Vec<String> = store
            .list_workers()
            .await
            .expect("list")
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(registry, vec!["monitoring-live".to_string()]);
    }

    #[tokio::test]
    async fn test_reconcile_continues_past_failed_stop() {
        let (mut manager, supervisor, _) = manager();
        let oldest = manager.spawn(WorkerType::Campaign).await.expect("spawn");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let middle = manager.spawn(WorkerType::Campaign).await.expect("spawn");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newest = manager.spawn(WorkerType::Campaign).await.expect("spawn");
        supervisor.refuse_terminate(newest.pid).await;

        let report = manager
            .reconcile(&counts(&[(WorkerType::Campaign, 0)]))
            .await
            .expect("reconcile");

        assert_eq!(report.failed_stops, vec![newest.id.clone()]);
        assert_eq!(report.stopped, vec![middle.id.clone(), oldest.id.clone()]);
        assert!(!report.is_noop());
        assert!(manager.get(&newest.id).is_some());
        assert!(supervisor.is_alive(newest.pid).await);
        assert_eq!(manager.current_counts()[&WorkerType::Campaign], 1);
    }

    #[tokio::test]
    async fn test_failed_stop_is_retried_next_reconcile() {
        let (mut manager, supervisor, _) = manager();
        let worker = manager.spawn(WorkerType::Campaign).await.expect("spawn");
        supervisor.refuse_terminate(worker.pid).await;
        let desired = counts(&[(WorkerType::Campaign, 0)]);

        let report = manager.reconcile(&desired).await.expect("reconcile");
        assert_eq!(report.failed_stops, vec![worker.id.clone()]);
        assert!(report.stopped.is_empty());

        supervisor.stuck.lock().await.clear();
        let report = manager.reconcile(&desired).await.expect("reconcile");
        assert_eq!(report.stopped, vec![worker.id.clone()]);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_health_check_keeps_worker_it_cannot_stop() {
        let (mut manager, supervisor, store) = manager();
        let stuck = manager.spawn(WorkerType::Monitoring).await.expect("spawn");
        let dead = manager.spawn(WorkerType::Campaign).await.expect("spawn");
        supervisor.refuse_terminate(stuck.pid).await;
        supervisor.kill(dead.pid).await;

        let mut heartbeat = Heartbeat::now(&stuck.id, WorkerType::Monitoring, stuck.pid, "host-a", 1);
        heartbeat.at = Utc::now() - chrono::Duration::seconds(301);
        store
            .write_heartbeat(&heartbeat, Duration::from_secs(600))
            .await
            .expect("heartbeat");

        let report = manager.health_check().await.expect("health check");

        assert_eq!(report.replaced.len(), 1);
        assert_eq!(report.replaced[0].old_id, dead.id);
        assert_eq!(
            manager.get(&stuck.id).map(|r| r.status),
            Some(WorkerStatus::Unresponsive)
        );
        assert_eq!(manager.restarts(WorkerType::Monitoring), 0);
        assert_eq!(manager.current_counts()[&WorkerType::Monitoring], 1);
        let spawned = supervisor.spawned.lock().await;
        assert_eq!(spawned.iter().filter(|(t, _)| *t == WorkerType::Monitoring).count(), 1);
    }

    #[tokio::test]
    async fn test_restart_keeps_worker_when_stop_fails() {
        let (mut manager, supervisor, _) = manager();
        let worker = manager.spawn(WorkerType::Statistics).await.expect("spawn");
        supervisor.refuse_terminate(worker.pid).await;

        assert!(matches!(
            manager.restart(&worker.id).await,
            Err(PoolError::Supervisor(SupervisorError::TerminateFailed { .. }))
        ));
        assert_eq!(manager.len(), 1);
        assert!(manager.get(&worker.id).is_some());
        assert_eq!(supervisor.spawned.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_restart_unknown_worker_errors() {
        let (mut manager, _, _) = manager();
        assert!(matches!(
            manager.restart("nope").await,
            Err(PoolError::WorkerNotFound(_))
        ));
    }
}
