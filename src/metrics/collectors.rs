//! High-level recording interface over the raw Prometheus metrics.
//!
//! `MetricsCollector` is a zero-sized handle. Every method is a no-op until
//! `init_metrics()` has run, so components can record unconditionally.

use crate::pool::{WorkerCounts, WorkerType};
use crate::queue::QueueStats;

use super::prometheus::{
    MASTER_RUNNING, QUEUE_DEPTH, TICKS_TOTAL, TICK_ERRORS_TOTAL, WORKERS, WORKER_RESTARTS_TOTAL,
};

/// Records orchestrator control-plane metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Sets the live worker gauge for every type.
    pub fn set_workers(&self, counts: &WorkerCounts) {
        if let Some(workers) = WORKERS.get() {
            for worker_type in WorkerType::ALL {
                let count = counts.get(&worker_type).copied().unwrap_or(0);
                workers
                    .with_label_values(&[worker_type.as_str()])
                    .set(count as f64);
            }
        }
    }

    /// Sets the queue depth gauge from a stats snapshot.
    pub fn set_queue_depth(&self, stats: &QueueStats) {
        if let Some(depth) = QUEUE_DEPTH.get() {
            depth.with_label_values(&["pending"]).set(stats.pending as f64);
            depth.with_label_values(&["delayed"]).set(stats.delayed as f64);
            depth.with_label_values(&["claimed"]).set(stats.claimed as f64);
            depth.with_label_values(&["dead"]).set(stats.dead as f64);
        }
    }

    pub fn set_master_running(&self, running: bool) {
        if let Some(gauge) = MASTER_RUNNING.get() {
            gauge.set(if running { 1.0 } else { 0.0 });
        }
    }

    /// Counts a worker replaced by the health check.
    pub fn record_restart(&self, worker_type: WorkerType) {
        if let Some(restarts) = WORKER_RESTARTS_TOTAL.get() {
            restarts.with_label_values(&[worker_type.as_str()]).inc();
        }
        tracing::trace!(worker_type = %worker_type, "Recorded worker restart");
    }

    /// Counts one control-loop iteration and whether it failed.
    pub fn record_tick(&self, failed: bool) {
        if let Some(ticks) = TICKS_TOTAL.get() {
            ticks.inc();
        }
        if failed {
            if let Some(errors) = TICK_ERRORS_TOTAL.get() {
                errors.inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_collector_updates_gauges() {
        init_metrics().expect("init");
        let collector = MetricsCollector::new();

        let counts: WorkerCounts = [(WorkerType::Campaign, 3)].into_iter().collect();
        collector.set_workers(&counts);
        collector.set_queue_depth(&QueueStats {
            pending: 7,
            dead: 2,
            ..Default::default()
        });
        collector.set_master_running(true);
        collector.record_restart(WorkerType::Monitoring);
        collector.record_tick(true);

        // Gauges are process-global and other tests write them too, so only
        // the series are checked here.
        let text = export_metrics();
        assert!(text.contains("dialer_workers{type=\"campaign\"}"));
        assert!(text.contains("dialer_workers{type=\"statistics\"}"));
        assert!(text.contains("dialer_queue_depth{state=\"dead\"}"));
        assert!(text.contains("dialer_master_running"));
        assert!(text.contains("dialer_worker_restarts_total{type=\"monitoring\"}"));
    }

    #[test]
    fn test_collector_without_init_does_not_panic() {
        let collector = MetricsCollector::new();
        collector.record_tick(false);
        collector.set_queue_depth(&QueueStats::default());
    }
}
