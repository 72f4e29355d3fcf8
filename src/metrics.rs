//! Prometheus-compatible metrics for admission and execution
//!
//! Counters and gauges are lock-free atomics from `prometheus-client`; only
//! [`Metrics::export`] touches the registry.

use prometheus_client::{
    encoding::text::encode,
    metrics::counter::Counter,
    metrics::gauge::Gauge,
    metrics::histogram::{exponential_buckets, Histogram},
    registry::Registry,
};
use std::time::Duration;

#[derive(Debug)]
pub struct Metrics {
    pub registry: Registry,

    /// Attempts handed to a kernel
    pub ops_started: Counter<u64>,
    pub ops_completed: Counter<u64>,
    /// Tasks that failed for good (placement, execution, failure budget)
    pub ops_failed: Counter<u64>,
    /// Attempts that ran out of memory and became eligible for retry
    pub memory_failures: Counter<u64>,
    /// Reservations the monitor turned down
    pub admission_rejections: Counter<u64>,

    pub running_ops: Gauge<i64>,
    pub streams_in_use: Gauge<i64>,

    /// Time spent waiting for an admission slot
    pub admission_wait_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let ops_started = Counter::default();
        registry.register(
            "devmux_ops_started",
            "Operation attempts handed to a kernel",
            ops_started.clone(),
        );

        let ops_completed = Counter::default();
        registry.register(
            "devmux_ops_completed",
            "Operations that completed successfully",
            ops_completed.clone(),
        );

        let ops_failed = Counter::default();
        registry.register(
            "devmux_ops_failed",
            "Operations that failed permanently",
            ops_failed.clone(),
        );

        let memory_failures = Counter::default();
        registry.register(
            "devmux_memory_failures",
            "Attempts that ran out of memory during execution",
            memory_failures.clone(),
        );

        let admission_rejections = Counter::default();
        registry.register(
            "devmux_admission_rejections",
            "Reservations rejected for lack of capacity",
            admission_rejections.clone(),
        );

        let running_ops = Gauge::default();
        registry.register(
            "devmux_running_ops",
            "Attempts currently executing",
            running_ops.clone(),
        );

        let streams_in_use = Gauge::default();
        registry.register(
            "devmux_streams_in_use",
            "GPU streams currently leased",
            streams_in_use.clone(),
        );

        // 100us .. 10s
        let admission_wait_seconds = Histogram::new(exponential_buckets(0.0001, 10.0, 6));
        registry.register(
            "devmux_admission_wait_seconds",
            "Time spent waiting for an admission slot",
            admission_wait_seconds.clone(),
        );

        Metrics {
            registry,
            ops_started,
            ops_completed,
            ops_failed,
            memory_failures,
            admission_rejections,
            running_ops,
            streams_in_use,
            admission_wait_seconds,
        }
    }

    pub fn record_admission_wait(&self, waited: Duration) {
        self.admission_wait_seconds.observe(waited.as_secs_f64());
    }

    pub fn set_streams_in_use(&self, streams: usize) {
        self.streams_in_use.set(streams as i64);
    }

    /// Prometheus text exposition
    pub fn export(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!(error = %e, "Failed to encode metrics");
        }
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
