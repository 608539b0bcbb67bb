//! Prometheus metrics registration and export.
//!
//! This module defines the control-plane metrics of the orchestrator and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all dialer metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Live workers, labeled by worker type.
pub static WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Tasks in the queue, labeled by state (pending, delayed, claimed, dead).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// 1 while this process is the running master, 0 otherwise.
pub static MASTER_RUNNING: OnceLock<Gauge> = OnceLock::new();

/// Workers replaced by the health check, labeled by worker type.
pub static WORKER_RESTARTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Control-loop iterations.
pub static TICKS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Control-loop iterations that ended in an error.
pub static TICK_ERRORS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once is harmless; later calls keep the metrics
/// created by the first.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let workers = GaugeVec::new(
        Opts::new("dialer_workers", "Live worker processes by type"),
        &["type"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("dialer_queue_depth", "Tasks in the queue by state"),
        &["state"],
    )?;

    let master_running = Gauge::new(
        "dialer_master_running",
        "Whether this process is the running master",
    )?;

    let worker_restarts_total = CounterVec::new(
        Opts::new(
            "dialer_worker_restarts_total",
            "Workers replaced after failing the health check",
        ),
        &["type"],
    )?;

    let ticks_total = Counter::new("dialer_ticks_total", "Control loop iterations")?;

    let tick_errors_total = Counter::new(
        "dialer_tick_errors_total",
        "Control loop iterations that failed",
    )?;

    registry.register(Box::new(workers.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(master_running.clone()))?;
    registry.register(Box::new(worker_restarts_total.clone()))?;
    registry.register(Box::new(ticks_total.clone()))?;
    registry.register(Box::new(tick_errors_total.clone()))?;

    // A concurrent initializer may have won the race; its metrics stay.
    let _ = REGISTRY.set(registry);
    let _ = WORKERS.set(workers);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = MASTER_RUNNING.set(master_running);
    let _ = WORKER_RESTARTS_TOTAL.set(worker_restarts_total);
    let _ = TICKS_TOTAL.set(ticks_total);
    let _ = TICK_ERRORS_TOTAL.set(tick_errors_total);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of failing when the registry is missing or
/// encoding fails, so the result can always be published.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
