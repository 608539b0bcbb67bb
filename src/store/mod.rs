//! Shared coordination state.
//!
//! Master and workers never share memory; everything that crosses a process
//! boundary goes through the backing store. This module owns the non-queue,
//! non-lock part of that state:
//!
//! - worker heartbeats (written by workers, read by the master)
//! - the worker registry mirror
//! - the master registration record
//! - the single-slot control-command channel
//! - the mirrored activity log and published metrics
//!
//! [`StateStore`] is implemented by [`RedisStateStore`] for production and by
//! [`MemoryStateStore`] for tests and single-process runs.

pub mod keys;
pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::orchestrator::{ControlCommand, MasterRegistration};
use crate::pool::{Heartbeat, WorkerRecord};

pub use self::keys::KeySpace;
pub use self::memory::MemoryStateStore;
pub use self::redis::{connect, RedisStateStore};

/// Coordination state shared between the master, workers and dashboards.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Writes a worker heartbeat that expires after `ttl`.
    async fn write_heartbeat(&self, heartbeat: &Heartbeat, ttl: Duration) -> Result<(), StoreError>;

    /// Reads the latest heartbeat of a worker, if it has not expired.
    async fn read_heartbeat(&self, worker_id: &str) -> Result<Option<Heartbeat>, StoreError>;

    /// Deletes a worker heartbeat.
    async fn clear_heartbeat(&self, worker_id: &str) -> Result<(), StoreError>;

    /// Inserts or replaces a worker in the registry mirror.
    async fn save_worker(&self, record: &WorkerRecord) -> Result<(), StoreError>;

    /// Removes a worker from the registry mirror.
    async fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError>;

    /// Lists the registry mirror.
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError>;

    /// Publishes the master registration; it expires after `ttl` unless refreshed.
    async fn publish_master(
        &self,
        registration: &MasterRegistration,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Reads the master registration.
    async fn read_master(&self) -> Result<Option<MasterRegistration>, StoreError>;

    /// Clears the master registration if it still belongs to `pid` on `hostname`.
    async fn clear_master(&self, pid: u32, hostname: &str) -> Result<bool, StoreError>;

    /// Stores a control command. Returns false if one is already pending.
    async fn submit_command(&self, command: &ControlCommand) -> Result<bool, StoreError>;

    /// Atomically removes and returns the pending control command.
    ///
    /// A malformed command is removed as well and reported as
    /// [`StoreError::CorruptRecord`].
    async fn take_command(&self) -> Result<Option<ControlCommand>, StoreError>;

    /// Appends a formatted log line, keeping at most `history` lines, and
    /// updates the "latest line" key.
    async fn append_log(&self, line: &str, history: usize) -> Result<(), StoreError>;

    /// Returns the most recent mirrored log line.
    async fn latest_log(&self) -> Result<Option<String>, StoreError>;

    /// Publishes the Prometheus text exposition for external scraping.
    async fn publish_metrics(&self, text: &str) -> Result<(), StoreError>;
}
