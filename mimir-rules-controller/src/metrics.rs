use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Name of the meter all controller instruments are registered with.
pub(crate) const METER_NAME: &'static str = "mimir-rules-controller";

const DURATION_BUCKETS: [f64; 12] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

pub(crate) fn metric_name(name: &str) -> String {
    format!("mimir_rules_controller_{}", name)
}

/// Sink for reconcile metrics, injected into the reconciler.
pub(crate) trait SyncMetrics: Send + Sync {
    fn record_sync(&self, duration: Duration, failed: bool);
}

pub(crate) struct OtelSyncMetrics {
    sync_count: Counter<u64>,
    sync_errors: Counter<u64>,
    sync_duration: Histogram<f64>,
}

impl OtelSyncMetrics {
    pub fn new(meter: &Meter) -> Self {
        let sync_count = meter
            .u64_counter(metric_name("sync"))
            .with_description("Number of MimirRule synchronizations")
            .build();
        let sync_errors = meter
            .u64_counter(metric_name("sync_errors"))
            .with_description("Number of failed MimirRule synchronizations")
            .build();
        let sync_duration = meter
            .f64_histogram(metric_name("sync_duration"))
            .with_unit("s")
            .with_description("Duration of MimirRule synchronizations")
            .with_boundaries(DURATION_BUCKETS.to_vec())
            .build();
        Self {
            sync_count,
            sync_errors,
            sync_duration,
        }
    }
}

impl SyncMetrics for OtelSyncMetrics {
    fn record_sync(&self, duration: Duration, failed: bool) {
        self.sync_count.add(1, &[]);
        if failed {
            self.sync_errors.add(1, &[]);
        }
        self.sync_duration.record(duration.as_secs_f64(), &[]);
    }
}
