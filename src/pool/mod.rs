//! Worker process pool.
//!
//! - [`worker`]: worker types, records and heartbeats
//! - [`supervisor`]: spawning, terminating and probing OS processes
//! - [`manager`]: desired counts, reconciliation and health checks

pub mod manager;
pub mod supervisor;
pub mod worker;

pub use manager::{
    plan_reconcile, AdoptReport, HealthReport, PoolAction, PoolError, PoolSettings, ReconcileReport, Replacement,
    WorkerCounts, WorkerPoolManager, RESPAWN_ESCALATION_THRESHOLD,
};
pub use supervisor::{OsProcessSupervisor, ProcessSupervisor, SupervisorError};
pub use worker::{local_hostname, Heartbeat, WorkerRecord, WorkerStatus, WorkerType};
