//! Master orchestrator.
//!
//! A single elected master keeps the worker population at target. Election
//! goes through the [`DistributedLock`]; losing the lock ends the control
//! loop immediately. Each tick of the loop runs, in order:
//!
//! 1. worker health check followed by lock renewal (when due)
//! 2. statistics snapshot and metrics publication (when due)
//! 3. at most one control command
//! 4. queue retry promotion and orphan recovery
//! 5. reconciliation against the active campaigns
//! 6. master registration refresh
//!
//! and then sleeps for `tick_interval`. A tick that fails is logged and
//! followed by `error_cooldown`; only a stop command, a cancelled token or a
//! lost lock end the loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, OrchestratorConfig};
use crate::error::StoreError;
use crate::lock::{DistributedLock, Lock, LockError};
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::pool::{
    HealthReport, PoolError, PoolSettings, ProcessSupervisor, WorkerPoolManager, WorkerType,
    RESPAWN_ESCALATION_THRESHOLD,
};
use crate::queue::{QueueError, RetryPolicy, TaskQueue};
use crate::sources::{CampaignSource, SourceError, StatsSink};
use crate::store::StateStore;

use super::activity::ActivityLog;
use super::command::ControlCommand;
use super::state::{ExitReason, MasterRegistration, MasterState};
use super::stats::{ProcessSampler, StatsSnapshot};

/// Lower bound of the master registration TTL.
const MIN_REGISTRATION_TTL: Duration = Duration::from_secs(30);

/// Errors that can occur in the master control loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The state machine was asked for a transition it does not allow.
    #[error("Invalid master state transition from {from} to {to}")]
    InvalidTransition { from: MasterState, to: MasterState },
}

/// Collaborators of the master, constructed once at startup.
pub struct MasterDeps {
    pub lock: Arc<dyn DistributedLock>,
    pub queue: Arc<dyn TaskQueue>,
    pub store: Arc<dyn StateStore>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub campaigns: Arc<dyn CampaignSource>,
    pub stats_sink: Arc<dyn StatsSink>,
}

/// The singleton control loop.
pub struct MasterOrchestrator {
    config: OrchestratorConfig,
    config_path: Option<PathBuf>,
    lock: Arc<dyn DistributedLock>,
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn StateStore>,
    campaigns: Arc<dyn CampaignSource>,
    stats_sink: Arc<dyn StatsSink>,
    pool: WorkerPoolManager,
    activity: ActivityLog,
    metrics: MetricsCollector,
    sampler: ProcessSampler,
    cancel: CancellationToken,
    hostname: String,
    state: MasterState,
    held: Option<Lock>,
    started_at: DateTime<Utc>,
    last_health_check: Option<Instant>,
    last_renewal: Instant,
    last_stats: Option<Instant>,
    active_campaigns: usize,
}

impl MasterOrchestrator {
    pub fn new(config: OrchestratorConfig, deps: MasterDeps, hostname: impl Into<String>) -> Self {
        if let Err(e) = init_metrics() {
            warn!(error = %e, "Failed to register orchestrator metrics");
        }

        let hostname = hostname.into();
        deps.queue.configure_retries(
            RetryPolicy::new(config.retry_base, config.retry_max),
            config.max_attempts,
        );
        let pool = WorkerPoolManager::new(
            deps.supervisor,
            deps.store.clone(),
            PoolSettings::from_config(&config),
            hostname.clone(),
        );
        let activity = ActivityLog::new(deps.store.clone(), "master", config.log_history);

        Self {
            config,
            config_path: None,
            lock: deps.lock,
            queue: deps.queue,
            store: deps.store,
            campaigns: deps.campaigns,
            stats_sink: deps.stats_sink,
            pool,
            activity,
            metrics: MetricsCollector::new(),
            sampler: ProcessSampler::new(),
            cancel: CancellationToken::new(),
            hostname,
            state: MasterState::Initializing,
            held: None,
            started_at: Utc::now(),
            last_health_check: None,
            last_renewal: Instant::now(),
            last_stats: None,
            active_campaigns: 0,
        }
    }

    /// File re-read by `reload_config`.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Uses an externally owned token, e.g. one cancelled by a signal handler.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPoolManager {
        &self.pool
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Elects, runs the control loop and shuts down.
    ///
    /// Losing the election is not an error: the master goes straight to
    /// `Stopped` and returns [`ExitReason::NotElected`].
    pub async fn run(&mut self) -> Result<ExitReason, OrchestratorError> {
        if !self.elect().await? {
            return Ok(ExitReason::NotElected);
        }
        let reason = self.control_loop().await;
        self.shutdown(&reason).await?;
        Ok(reason)
    }

    /// Tries to become master. On success the state is `Running`, previous
    /// workers on this host are adopted and the registration is published.
    pub async fn elect(&mut self) -> Result<bool, OrchestratorError> {
        let acquired = match self
            .lock
            .acquire(&self.config.master_lock_key, self.config.lock_ttl())
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(error = %e, "Master lock acquisition failed, not taking over");
                None
            }
        };

        let Some(lock) = acquired else {
            info!(resource = %self.config.master_lock_key, "Another master is active");
            self.transition(MasterState::Stopped)?;
            return Ok(false);
        };

        self.held = Some(lock);
        self.last_renewal = Instant::now();
        self.started_at = Utc::now();
        self.transition(MasterState::Running)?;
        self.metrics.set_master_running(true);
        self.activity
            .info(format!(
                "Master started on {} (pid {})",
                self.hostname,
                std::process::id()
            ))
            .await;

        match self.pool.adopt_existing().await {
            Ok(report) => {
                for record in &report.abandoned {
                    self.activity
                        .warn(format!(
                            "Dropped {} worker {} (pid {}) registered by host {}; stop it there if it still runs",
                            record.worker_type, record.id, record.pid, record.hostname
                        ))
                        .await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to adopt existing workers"),
        }
        if let Err(e) = self.publish_registration().await {
            warn!(error = %e, "Failed to publish master registration");
        }
        Ok(true)
    }

    async fn control_loop(&mut self) -> ExitReason {
        let cancel = self.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                return ExitReason::Cancelled;
            }

            let pause = match self.tick().await {
                Ok(Some(reason)) => {
                    self.metrics.record_tick(false);
                    return reason;
                }
                Ok(None) => {
                    self.metrics.record_tick(false);
                    self.config.tick_interval
                }
                Err(e) => {
                    self.metrics.record_tick(true);
                    self.activity.error(format!("Control loop iteration failed: {}", e)).await;
                    self.config.tick_interval + self.config.error_cooldown
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return ExitReason::Cancelled,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Runs one iteration of the control loop.
    ///
    /// Returns the reason to stop when the loop must end.
    pub async fn tick(&mut self) -> Result<Option<ExitReason>, OrchestratorError> {
        // 1. Health check, then renewal. A failed health check still renews.
        if is_due(self.last_health_check, self.config.health_check_interval) {
            self.last_health_check = Some(Instant::now());
            let health = self.pool.health_check().await;
            if !self.renew_lock().await {
                return Ok(Some(ExitReason::LockLost));
            }
            self.report_health(health?).await;
        } else if self.last_renewal.elapsed() >= self.config.renew_interval && !self.renew_lock().await {
            return Ok(Some(ExitReason::LockLost));
        }

        // 2. Statistics.
        if is_due(self.last_stats, self.config.stats_update_interval) {
            self.last_stats = Some(Instant::now());
            self.publish_stats().await?;
        }

        // 3. One control command.
        match self.store.take_command().await {
            Ok(Some(command)) => {
                if let Some(reason) = self.handle_command(command).await {
                    return Ok(Some(reason));
                }
            }
            Ok(None) => {}
            Err(StoreError::CorruptRecord { key, reason }) => {
                self.activity
                    .warn(format!("Discarded malformed command at {}: {}", key, reason))
                    .await;
            }
            Err(e) => return Err(e.into()),
        }

        // 4. Queue maintenance.
        let promoted = self.queue.process_retries().await?;
        let recovered = self.queue.recover_orphans(self.config.orphan_grace).await?;
        if promoted > 0 {
            debug!(promoted, "Re-admitted tasks after backoff");
        }
        if recovered > 0 {
            self.activity
                .warn(format!("Recovered {} orphaned task claim(s)", recovered))
                .await;
        }

        // 5. Reconcile.
        let campaigns = self.campaigns.active_campaigns().await?;
        self.active_campaigns = campaigns.len();
        let desired = self.pool.desired_counts(&campaigns);
        let report = self.pool.reconcile(&desired).await?;
        for worker_type in dedup_types(&report.failed) {
            self.escalate_spawn_failures(worker_type).await;
        }
        for worker_id in &report.failed_stops {
            self.activity
                .warn(format!("Could not stop excess worker {}, retrying next tick", worker_id))
                .await;
        }

        // 6. Registration.
        self.publish_registration().await?;

        Ok(None)
    }

    async fn renew_lock(&mut self) -> bool {
        let Some(lock) = &self.held else {
            return false;
        };
        match self
            .lock
            .renew(&lock.resource_key, &lock.token, self.config.lock_ttl())
            .await
        {
            Ok(true) => {
                self.last_renewal = Instant::now();
                true
            }
            Ok(false) => {
                self.held = None;
                self.activity.error("Master lock lost, abdicating").await;
                false
            }
            Err(e) => {
                self.held = None;
                self.activity
                    .error(format!("Master lock renewal failed, abdicating: {}", e))
                    .await;
                false
            }
        }
    }

    async fn report_health(&mut self, report: HealthReport) {
        for replacement in &report.replaced {
            self.metrics.record_restart(replacement.worker_type);
            match &replacement.new_id {
                Some(new_id) => {
                    self.activity
                        .warn(format!(
                            "Replaced {} worker {} with {} ({})",
                            replacement.worker_type, replacement.old_id, new_id, replacement.reason
                        ))
                        .await
                }
                None => {
                    self.activity
                        .warn(format!(
                            "Stopped {} worker {} ({}), respawn failed",
                            replacement.worker_type, replacement.old_id, replacement.reason
                        ))
                        .await;
                    self.escalate_spawn_failures(replacement.worker_type).await;
                }
            }
        }
        debug!(healthy = report.healthy, replaced = report.replaced.len(), "Health check complete");
    }

    async fn escalate_spawn_failures(&self, worker_type: WorkerType) {
        let failures = self.pool.spawn_failures(worker_type);
        if failures >= RESPAWN_ESCALATION_THRESHOLD {
            self.activity
                .error(format!(
                    "Spawning {} workers failed {} times in a row",
                    worker_type, failures
                ))
                .await;
        }
    }

    async fn publish_stats(&mut self) -> Result<(), OrchestratorError> {
        let queue = self.queue.stats().await?;
        let workers = self.pool.current_counts();
        self.metrics.set_workers(&workers);
        self.metrics.set_queue_depth(&queue);

        let snapshot = StatsSnapshot::new(
            self.hostname.clone(),
            self.sampler.uptime_secs(),
            self.sampler.memory_bytes(),
            workers,
            queue,
            self.active_campaigns,
        );
        self.stats_sink.record(&snapshot).await?;
        self.store.publish_metrics(&export_metrics()).await?;

        debug!(
            workers = snapshot.workers_total,
            pending = snapshot.queue.pending,
            memory_bytes = snapshot.memory_bytes,
            "Published statistics"
        );
        Ok(())
    }

    async fn handle_command(&mut self, command: ControlCommand) -> Option<ExitReason> {
        let label = command.to_string();
        self.activity.info(format!("Executing command {}", label)).await;

        let outcome: Result<String, OrchestratorError> = match command {
            ControlCommand::Stop => return Some(ExitReason::StopCommand),
            ControlCommand::RestartWorker { worker_id } => self
                .pool
                .restart(&worker_id)
                .await
                .map(|record| format!("Restarted worker {} as {}", worker_id, record.id))
                .map_err(Into::into),
            ControlCommand::AddWorker { worker_type } => self
                .pool
                .add_worker(worker_type)
                .await
                .map(|record| format!("Added {} worker {}", worker_type, record.id))
                .map_err(Into::into),
            ControlCommand::RemoveWorker { worker_id } => self
                .pool
                .remove_worker(&worker_id)
                .await
                .map(|worker_type| format!("Removed {} worker {}", worker_type, worker_id))
                .map_err(Into::into),
            ControlCommand::ClearQueue => self
                .queue
                .clear()
                .await
                .map(|removed| format!("Cleared {} queued task(s)", removed))
                .map_err(Into::into),
            ControlCommand::ReloadConfig => self.reload_config().await,
        };

        match outcome {
            Ok(message) => self.activity.info(message).await,
            Err(e) => self.activity.error(format!("Command {} failed: {}", label, e)).await,
        }
        None
    }

    /// Re-reads configuration and applies the runtime tunables.
    async fn reload_config(&mut self) -> Result<String, OrchestratorError> {
        let fresh = OrchestratorConfig::load(self.config_path.as_deref())?;
        let ignored = self.config.apply_runtime_tunables(&fresh);

        self.pool.update_settings(PoolSettings::from_config(&self.config));
        self.queue.configure_retries(
            RetryPolicy::new(self.config.retry_base, self.config.retry_max),
            self.config.max_attempts,
        );
        self.activity.set_history(self.config.log_history);

        if !ignored.is_empty() {
            self.activity
                .warn(format!(
                    "Changed settings need a restart and were ignored: {}",
                    ignored.join(", ")
                ))
                .await;
        }
        Ok("Configuration reloaded".to_string())
    }

    async fn publish_registration(&self) -> Result<(), StoreError> {
        let registration = MasterRegistration::new(self.hostname.clone(), self.started_at, self.state);
        self.store
            .publish_master(&registration, self.registration_ttl())
            .await
    }

    fn registration_ttl(&self) -> Duration {
        (self.config.health_check_interval * 3).max(MIN_REGISTRATION_TTL)
    }

    /// Stops every worker, releases the lock and clears the registration.
    async fn shutdown(&mut self, reason: &ExitReason) -> Result<(), OrchestratorError> {
        self.transition(MasterState::ShuttingDown)?;
        self.activity.info(format!("Master shutting down: {}", reason)).await;
        if let Err(e) = self.publish_registration().await {
            debug!(error = %e, "Failed to publish shutdown state");
        }

        let stopped = self.pool.terminate_all().await;

        if let Some(lock) = self.held.take() {
            match self.lock.release(&lock.resource_key, &lock.token).await {
                Ok(true) => debug!(resource = %lock.resource_key, "Released master lock"),
                Ok(false) => warn!(resource = %lock.resource_key, "Master lock was no longer ours"),
                Err(e) => warn!(error = %e, "Failed to release master lock, it will expire"),
            }
        }

        match self.store.clear_master(std::process::id(), &self.hostname).await {
            Ok(true) => {}
            Ok(false) => debug!("Master registration already replaced"),
            Err(e) => warn!(error = %e, "Failed to clear master registration"),
        }

        self.transition(MasterState::Stopped)?;
        self.metrics.set_master_running(false);
        self.activity
            .info(format!("Master stopped, {} worker(s) terminated", stopped))
            .await;
        Ok(())
    }

    fn transition(&mut self, to: MasterState) -> Result<(), OrchestratorError> {
        if !self.state.can_transition(to) {
            error!(from = %self.state, to = %to, "Rejected master state transition");
            return Err(OrchestratorError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        info!(from = %self.state, to = %to, "Master state changed");
        self.state = to;
        Ok(())
    }
}

fn is_due(last: Option<Instant>, every: Duration) -> bool {
    last.map_or(true, |at| at.elapsed() >= every)
}

fn dedup_types(types: &[WorkerType]) -> Vec<WorkerType> {
    let mut unique = types.to_vec();
    unique.sort();
    unique.dedup();
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLock;
    use crate::pool::{SupervisorError, WorkerRecord, WorkerStatus};
    use crate::queue::MemoryTaskQueue;
    use crate::sources::{ActiveCampaign, MemoryStatsSink, StaticCampaignSource};
    use crate::store::MemoryStateStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeSupervisor {
        next_pid: AtomicU32,
        alive: Mutex<HashSet<u32>>,
        stuck: Mutex<HashSet<u32>>,
    }

    #[async_trait]
    impl ProcessSupervisor for FakeSupervisor {
        async fn spawn(&self, _worker_type: WorkerType, _worker_id: &str) -> Result<u32, SupervisorError> {
            let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.alive.lock().await.insert(pid);
            Ok(pid)
        }

        async fn terminate(&self, pid: u32, _grace: Duration) -> Result<(), SupervisorError> {
            if self.stuck.lock().await.contains(&pid) {
                return Err(SupervisorError::TerminateFailed {
                    pid,
                    reason: "operation not permitted".to_string(),
                });
            }
            self.alive.lock().await.remove(&pid);
            Ok(())
        }

        async fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().await.contains(&pid)
        }
    }

    struct Harness {
        lock: Arc<MemoryLock>,
        queue: Arc<MemoryTaskQueue>,
        store: Arc<MemoryStateStore>,
        supervisor: Arc<FakeSupervisor>,
        campaigns: Arc<StaticCampaignSource>,
        sink: Arc<MemoryStatsSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                lock: Arc::new(MemoryLock::new()),
                queue: Arc::new(MemoryTaskQueue::new()),
                store: Arc::new(MemoryStateStore::new()),
                supervisor: Arc::new(FakeSupervisor::default()),
                campaigns: Arc::new(StaticCampaignSource::new(vec![
                    ActiveCampaign::new("1", 5, 0),
                    ActiveCampaign::new("2", 5, 0),
                ])),
                sink: Arc::new(MemoryStatsSink::new()),
            }
        }

        fn master(&self, hostname: &str) -> MasterOrchestrator {
            let deps = MasterDeps {
                lock: self.lock.clone(),
                queue: self.queue.clone(),
                store: self.store.clone(),
                supervisor: self.supervisor.clone(),
                campaigns: self.campaigns.clone(),
                stats_sink: self.sink.clone(),
            };
            MasterOrchestrator::new(test_config(), deps, hostname)
        }
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_intervals(
                Duration::from_millis(20),
                Duration::from_millis(20),
                Duration::from_millis(5),
            )
            .with_lock_timing(Duration::from_millis(50), Duration::from_secs(300))
            .with_error_cooldown(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_singleton_election() {
        let harness = Harness::new();
        let mut first = harness.master("host-a");
        let mut second = harness.master("host-b");

        assert!(first.elect().await.expect("elect"));
        assert_eq!(first.state(), MasterState::Running);

        let reason = second.run().await.expect("run");
        assert_eq!(reason, ExitReason::NotElected);
        assert_eq!(second.state(), MasterState::Stopped);

        let registration = harness.store.read_master().await.expect("read").expect("published");
        assert_eq!(registration.hostname, "host-a");
        assert_eq!(registration.state, MasterState::Running);
    }

    #[tokio::test]
    async fn test_first_tick_builds_population() {
        let harness = Harness::new();
        let mut master = harness.master("host-a");
        assert!(master.elect().await.expect("elect"));

        assert_eq!(master.tick().await.expect("tick"), None);

        let counts = master.pool().current_counts();
        assert_eq!(counts[&WorkerType::Monitoring], 1);
        assert_eq!(counts[&WorkerType::Statistics], 1);
        assert_eq!(counts[&WorkerType::Campaign], 2);
        assert_eq!(harness.store.list_workers().await.expect("list").len(), 4);

        assert_eq!(harness.sink.snapshots().await.len(), 1);
        let metrics = harness.store.metrics_text().await.expect("metrics published");
        assert!(metrics.contains("dialer_master_running"));
    }

    #[tokio::test]
    async fn test_stop_command_shuts_down_cleanly() {
        let harness = Harness::new();
        let mut master = harness.master("host-a");
        harness
            .store
            .submit_command(&ControlCommand::Stop)
            .await
            .expect("submit");

        let reason = master.run().await.expect("run");

        assert_eq!(reason, ExitReason::StopCommand);
        assert_eq!(master.state(), MasterState::Stopped);
        assert!(master.pool().is_empty());
        assert!(harness.store.read_master().await.expect("read").is_none());
        // Lock was released, so a successor can take over at once.
        assert!(harness
            .lock
            .acquire("master", Duration::from_secs(1))
            .await
            .expect("acquire")
            .is_some());
    }

    #[tokio::test]
    async fn test_lock_loss_abdicates() {
        let harness = Harness::new();
        let mut master = harness.master("host-a");
        assert!(master.elect().await.expect("elect"));
        assert_eq!(master.tick().await.expect("tick"), None);

        harness.lock.force_expire("master").await;
        let usurper = harness
            .lock
            .acquire("master", Duration::from_secs(300))
            .await
            .expect("acquire");
        assert!(usurper.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(master.tick().await.expect("tick"), Some(ExitReason::LockLost));
    }

    #[tokio::test]
    async fn test_lock_loss_ends_run() {
        let harness = Harness::new();
        let mut master = harness.master("host-a");
        let lock = harness.lock.clone();

        let expire = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            lock.force_expire("master").await;
            lock.acquire("master", Duration::from_secs(300)).await.expect("acquire")
        });

        let reason = master.run().await.expect("run");
        assert!(expire.await.expect("join").is_some());
        assert_eq!(reason, ExitReason::LockLost);
        assert_eq!(master.state(), MasterState::Stopped);
        assert!(master.pool().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_loop() {
        let harness = Harness::new();
        let token = CancellationToken::new();
        let mut master = harness.master("host-a").with_cancellation(token.clone());

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });

        let reason = master.run().await.expect("run");
        cancel.await.expect("join");
        assert_eq!(reason, ExitReason::Cancelled);
        assert_eq!(harness.supervisor.alive.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn test_add_and_remove_worker_commands_persist() {
        let harness = Harness::new();
        let mut master = harness.master("host-a");
        assert!(master.elect().await.expect("elect"));
        master.tick().await.expect("tick");

        harness
            .store
            .submit_command(&ControlCommand::AddWorker {
                worker_type: WorkerType::Statistics,
            })
            .await
            .expect("submit");
        master.tick().await.expect("tick");
        assert_eq!(master.pool().current_counts()[&WorkerType::Statistics], 2);

        let campaign_worker = master
            .pool()
            .workers()
            .find(|r| r.worker_type == WorkerType::Campaign)
            .map(|r| r.id.clone())
            .expect("campaign worker");
        harness
            .store
            .submit_command(&ControlCommand::RemoveWorker {
                worker_id: campaign_worker.clone(),
            })
            .await
            .expect("submit");
        master.tick().await.expect("tick");

        let counts = master.pool().current_counts();
        assert_eq!(counts[&WorkerType::Statistics], 2);
        assert_eq!(counts[&WorkerType::Campaign], 1);
        assert!(master.pool().get(&campaign_worker).is_none());
    }

    #[tokio::test]
    async fn test_restart_unknown_worker_is_not_fatal() {
        let harness = Harness::new();
        let mut master = harness.master("host-a");
        assert!(master.elect().await.expect("elect"));

        harness
            .store
            .submit_command(&ControlCommand::RestartWorker {
                worker_id: "campaign-missing".to_string(),
            })
            .await
            .expect("submit");

        assert_eq!(master.tick().await.expect("tick"), None);
        let lines = harness.store.log_lines().await;
        assert!(lines
            .iter()
            .any(|l| l.contains("[ERROR] Command restart_worker(campaign-missing) failed")));
    }

    #[tokio::test]
    async fn test_tick_survives_worker_that_will_not_stop() {
        let harness = Harness::new();
        let mut master = harness.master("host-a");
        assert!(master.elect().await.expect("elect"));
        assert_eq!(master.tick().await.expect("tick"), None);

        let campaign_pids: Vec<u32> = master
            .pool()
            .workers()
            .filter(|r| r.worker_type == WorkerType::Campaign)
            .map(|r| r.pid)
            .collect();
        harness.supervisor.stuck.lock().await.extend(campaign_pids);
        harness.campaigns.set(Vec::new()).await;
        harness.store.clear_master(std::process::id(), "host-a").await.expect("clear");

        assert_eq!(master.tick().await.expect("tick"), None);

        assert_eq!(master.pool().current_counts()[&WorkerType::Campaign], 2);
        let registration = harness.store.read_master().await.expect("read").expect("republished");
        assert_eq!(registration.state, MasterState::Running);
        let lines = harness.store.log_lines().await;
        assert_eq!(
            lines
                .iter()
                .filter(|l| l.contains("[WARN] Could not stop excess worker campaign-"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_election_reports_workers_of_other_hosts() {
        let harness = Harness::new();
        let foreign = WorkerRecord::new("campaign-foreign", WorkerType::Campaign, 4242, "host-z");
        harness.store.save_worker(&foreign).await.expect("save");

        let mut master = harness.master("host-a");
        assert!(master.elect().await.expect("elect"));

        assert!(master.pool().get("campaign-foreign").is_none());
        assert!(harness.store.list_workers().await.expect("list").is_empty());
        let lines = harness.store.log_lines().await;
        assert!(lines.iter().any(|l| l.contains(
            "[WARN] Dropped campaign worker campaign-foreign (pid 4242) registered by host host-z"
        )));
    }

    #[tokio::test]
    async fn test_malformed_command_is_discarded() {
        let harness = Harness::new();
        let mut master = harness.master("host-a");
        assert!(master.elect().await.expect("elect"));
        harness.store.put_raw_command("{\"action\":\"explode\"}").await;

        assert_eq!(master.tick().await.expect("tick"), None);
        assert!(harness.store.take_command().await.expect("take").is_none());
        assert!(harness
            .store
            .log_lines()
            .await
            .iter()
            .any(|l| l.contains("Discarded malformed command")));
    }

    #[tokio::test]
    async fn test_clear_queue_command() {
        let harness = Harness::new();
        let mut master = harness.master("host-a");
        assert!(master.elect().await.expect("elect"));
        for _ in 0..3 {
            harness
                .queue
                .enqueue("campaign", serde_json::json!({}))
                .await
                .expect("enqueue");
        }

        harness
            .store
            .submit_command(&ControlCommand::ClearQueue)
            .await
            .expect("submit");
        master.tick().await.expect("tick");

        assert_eq!(harness.queue.stats().await.expect("stats").outstanding(), 0);
    }

    #[tokio::test]
    async fn test_reload_config_applies_tunables() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "max_campaign_workers: 1\nmax_attempts: 7").expect("write yaml");

        let harness = Harness::new();
        let mut master = harness.master("host-a").with_config_path(file.path());
        assert!(master.elect().await.expect("elect"));

        harness
            .store
            .submit_command(&ControlCommand::ReloadConfig)
            .await
            .expect("submit");
        master.tick().await.expect("tick");

        assert_eq!(master.pool().settings().max_campaign_workers, 1);
        assert_eq!(master.pool().current_counts()[&WorkerType::Campaign], 1);
        assert_eq!(harness.queue.default_max_attempts(), 7);
    }

    #[tokio::test]
    async fn test_dead_worker_is_replaced() {
        let harness = Harness::new();
        let mut master = harness.master("host-a");
        assert!(master.elect().await.expect("elect"));
        master.tick().await.expect("tick");

        let monitoring = master
            .pool()
            .workers()
            .find(|r| r.worker_type == WorkerType::Monitoring)
            .cloned()
            .expect("monitoring worker");
        harness.supervisor.alive.lock().await.remove(&monitoring.pid);

        tokio::time::sleep(Duration::from_millis(25)).await;
        master.tick().await.expect("tick");

        assert!(master.pool().get(&monitoring.id).is_none());
        assert_eq!(master.pool().current_counts()[&WorkerType::Monitoring], 1);
        assert_eq!(master.pool().restarts(WorkerType::Monitoring), 1);
        assert!(master
            .pool()
            .workers()
            .all(|r| r.status != WorkerStatus::Stopped));
    }

    #[test]
    fn test_is_due() {
        assert!(is_due(None, Duration::from_secs(60)));
        assert!(!is_due(Some(Instant::now()), Duration::from_secs(60)));
        assert!(is_due(Some(Instant::now()), Duration::ZERO));
    }

    #[test]
    fn test_registration_ttl_has_floor() {
        let harness = Harness::new();
        let master = harness.master("host-a");
        assert_eq!(master.registration_ttl(), MIN_REGISTRATION_TTL);
    }
}
