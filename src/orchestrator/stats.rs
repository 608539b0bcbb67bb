//! Aggregate statistics published by the master.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

use crate::pool::{WorkerCounts, WorkerType};
use crate::queue::QueueStats;

/// One statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub hostname: String,
    pub master_pid: u32,
    pub uptime_secs: u64,
    /// Resident memory of the master process.
    pub memory_bytes: u64,
    pub workers: BTreeMap<WorkerType, usize>,
    pub workers_total: usize,
    pub queue: QueueStats,
    pub active_campaigns: usize,
}

impl StatsSnapshot {
    pub fn new(
        hostname: impl Into<String>,
        uptime_secs: u64,
        memory_bytes: u64,
        workers: WorkerCounts,
        queue: QueueStats,
        active_campaigns: usize,
    ) -> Self {
        let workers_total = workers.values().sum();
        Self {
            taken_at: Utc::now(),
            hostname: hostname.into(),
            master_pid: std::process::id(),
            uptime_secs,
            memory_bytes,
            workers,
            workers_total,
            queue,
            active_campaigns,
        }
    }
}

/// Samples resource usage of the current process.
pub struct ProcessSampler {
    started: Instant,
    pid: Pid,
    system: System,
}

impl ProcessSampler {
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
        );
        Self {
            started: Instant::now(),
            pid,
            system,
        }
    }

    /// Seconds since the sampler was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Resident memory in bytes, or 0 if the process table is unavailable.
    pub fn memory_bytes(&mut self) -> u64 {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        self.system
            .process(self.pid)
            .map(|process| process.memory())
            .unwrap_or(0)
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}
