//! Worker definitions for the pool manager.
//!
//! - `WorkerType`: the unit-of-work a worker process executes
//! - `WorkerStatus`: lifecycle status as observed by the master
//! - `WorkerRecord`: the master's bookkeeping for one worker process
//! - `Heartbeat`: the liveness record a worker writes about itself

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of work a worker process performs.
///
/// The declaration order is the spawn priority used by reconciliation when
/// several types are under target at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    /// Watches running campaigns and line state. Exactly one is always present.
    Monitoring,
    /// Aggregates call statistics. Exactly one is always present.
    Statistics,
    /// Places calls for a running campaign.
    Campaign,
}

impl WorkerType {
    /// All worker types in spawn-priority order.
    pub const ALL: [WorkerType; 3] = [
        WorkerType::Monitoring,
        WorkerType::Statistics,
        WorkerType::Campaign,
    ];

    /// Name used in keys, task types and CLI arguments.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Monitoring => "monitoring",
            WorkerType::Statistics => "statistics",
            WorkerType::Campaign => "campaign",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monitoring" => Ok(WorkerType::Monitoring),
            "statistics" | "stats" => Ok(WorkerType::Statistics),
            "campaign" => Ok(WorkerType::Campaign),
            other => Err(format!(
                "unknown worker type '{}': expected monitoring, statistics or campaign",
                other
            )),
        }
    }
}

/// Status of a worker as seen by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Spawned, no heartbeat seen yet.
    Starting,
    /// Heartbeat is fresh and the process is alive.
    Active,
    /// Heartbeat went stale or the process vanished; about to be replaced.
    Unresponsive,
    /// Terminated by the master.
    Stopped,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Starting => write!(f, "starting"),
            WorkerStatus::Active => write!(f, "active"),
            WorkerStatus::Unresponsive => write!(f, "unresponsive"),
            WorkerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// The master's record of one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Unique worker identifier, passed to the process as `--id`.
    pub id: String,
    /// Kind of work.
    pub worker_type: WorkerType,
    /// OS process id.
    pub pid: u32,
    /// Host the process runs on.
    pub hostname: String,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
    /// Timestamp of the most recent heartbeat read by the master.
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Current status.
    pub status: WorkerStatus,
}

impl WorkerRecord {
    /// Creates a record for a freshly spawned process.
    pub fn new(id: impl Into<String>, worker_type: WorkerType, pid: u32, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            worker_type,
            pid,
            hostname: hostname.into(),
            started_at: Utc::now(),
            last_heartbeat: None,
            status: WorkerStatus::Starting,
        }
    }

    /// Generates a worker id of the form `{type}-{8 hex chars}`.
    pub fn generate_id(worker_type: WorkerType) -> String {
        let uuid = Uuid::new_v4().simple().to_string();
        format!("{}-{}", worker_type, &uuid[..8])
    }

    /// Time since the process was spawned.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Returns true when the worker has exceeded its liveness budget.
    ///
    /// A worker with a heartbeat is stale once the heartbeat is older than
    /// `timeout`. A worker that never reported is stale once it has been
    /// running longer than `bootstrap_grace`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration, bootstrap_grace: Duration) -> bool {
        match self.last_heartbeat {
            Some(at) => {
                // Negative elapsed time means clock skew; treat as fresh.
                (now - at).to_std().map(|d| d > timeout).unwrap_or(false)
            }
            None => self.age(now) > bootstrap_grace,
        }
    }
}

/// Liveness record written by a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub worker_type: WorkerType,
    pub pid: u32,
    pub hostname: String,
    pub at: DateTime<Utc>,
    /// Tasks handled since the worker started.
    #[serde(default)]
    pub tasks_processed: u64,
}

impl Heartbeat {
    /// Creates a heartbeat stamped with the current time.
    pub fn now(
        worker_id: impl Into<String>,
        worker_type: WorkerType,
        pid: u32,
        hostname: impl Into<String>,
        tasks_processed: u64,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_type,
            pid,
            hostname: hostname.into(),
            at: Utc::now(),
            tasks_processed,
        }
    }
}

/// Returns this machine's host name.
pub fn local_hostname() -> String {
    sysinfo::System::host_name()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_type_round_trip_names() {
        for worker_type in WorkerType::ALL {
            let parsed: WorkerType = worker_type.as_str().parse().expect("should parse");
            assert_eq!(parsed, worker_type);
        }
        assert_eq!("STATS".parse::<WorkerType>(), Ok(WorkerType::Statistics));
        assert!("dialer".parse::<WorkerType>().is_err());
    }

    #[test]
    fn test_worker_type_priority_order() {
        let mut types = vec![WorkerType::Campaign, WorkerType::Statistics, WorkerType::Monitoring];
        types.sort();
        assert_eq!(types, WorkerType::ALL.to_vec());
    }

    #[test]
    fn test_worker_type_serde() {
        let json = serde_json::to_string(&WorkerType::Campaign).expect("serialize");
        assert_eq!(json, "\"campaign\"");
    }

    #[test]
    fn test_generate_id() {
        let id = WorkerRecord::generate_id(WorkerType::Monitoring);
        assert!(id.starts_with("monitoring-"));
        assert_eq!(id.len(), "monitoring-".len() + 8);
        assert_ne!(id, WorkerRecord::generate_id(WorkerType::Monitoring));
    }

    #[test]
    fn test_stale_with_heartbeat() {
        let now = Utc::now();
        let mut record = WorkerRecord::new("w1", WorkerType::Monitoring, 42, "host");
        record.started_at = now - chrono::Duration::seconds(1000);
        record.last_heartbeat = Some(now - chrono::Duration::seconds(301));

        assert!(record.is_stale(now, Duration::from_secs(300), Duration::from_secs(60)));

        record.last_heartbeat = Some(now - chrono::Duration::seconds(10));
        assert!(!record.is_stale(now, Duration::from_secs(300), Duration::from_secs(60)));
    }

    #[test]
    fn test_stale_without_first_heartbeat() {
        let now = Utc::now();
        let mut record = WorkerRecord::new("w1", WorkerType::Campaign, 42, "host");

        record.started_at = now - chrono::Duration::seconds(30);
        assert!(!record.is_stale(now, Duration::from_secs(300), Duration::from_secs(60)));

        record.started_at = now - chrono::Duration::seconds(61);
        assert!(record.is_stale(now, Duration::from_secs(300), Duration::from_secs(60)));
    }

    #[test]
    fn test_future_heartbeat_is_not_stale() {
        let now = Utc::now();
        let mut record = WorkerRecord::new("w1", WorkerType::Campaign, 42, "host");
        record.last_heartbeat = Some(now + chrono::Duration::seconds(30));
        assert!(!record.is_stale(now, Duration::from_secs(1), Duration::from_secs(1)));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(WorkerStatus::Starting.to_string(), "starting");
        assert_eq!(WorkerStatus::Unresponsive.to_string(), "unresponsive");
    }
}
