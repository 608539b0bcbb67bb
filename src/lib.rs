//! dialer-orchestrator: orchestration layer of an auto-dialer platform.
//!
//! A singleton master, elected through a Redis lock, supervises monitoring,
//! statistics and campaign worker processes. Work reaches the workers through
//! a durable task queue with visibility timeouts, retry backoff and orphan
//! recovery. Master and workers share no memory; all coordination state
//! lives in the backing store.

pub mod cli;
pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod sources;
pub mod store;
pub mod worker;

// Re-export commonly used error types
pub use config::ConfigError;
pub use error::StoreError;
pub use lock::LockError;
pub use orchestrator::OrchestratorError;
pub use pool::{PoolError, SupervisorError};
pub use queue::QueueError;
pub use sources::SourceError;
pub use worker::WorkerError;
