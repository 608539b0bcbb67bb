//! Metrics module for Prometheus-based monitoring.
//!
//! The master records worker counts, queue depth, restarts and loop health
//! here and publishes the text exposition to the shared store on every stats
//! update, so no HTTP listener is needed in the orchestrator itself.
//!
//! # Example
//!
//! ```ignore
//! use dialer_orchestrator::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! MetricsCollector::new().record_tick(false);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    MASTER_RUNNING, QUEUE_DEPTH, REGISTRY, TICKS_TOTAL, TICK_ERRORS_TOTAL, WORKERS,
    WORKER_RESTARTS_TOTAL,
};
