//! Metrics registry for Windrose observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconcile passes (duration, error counts by reason)
//! - Windows worker population (joined nodes, tracked VMs)
//! - Cloud-side VM operations (create/destroy/configure outcomes)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Global meter for Windrose metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("windrose"));

/// Gauge of Windows worker nodes currently joined to the cluster
pub static JOINED_MACHINES: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("windrose_joined_machines")
        .with_description("Number of Windows worker nodes joined to the cluster")
        .with_unit("{nodes}")
        .build()
});

/// Gauge of VMs tracked in the registry
pub static TRACKED_VMS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("windrose_tracked_vms")
        .with_description("Number of VMs in the controller registry")
        .with_unit("{vms}")
        .build()
});

/// Histogram of reconcile pass duration
///
/// Labels:
/// - `config`: resource name
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("windrose_reconcile_duration_seconds")
        .with_description("Duration of reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconcile errors
///
/// Labels:
/// - `config`: resource name
/// - `reason`: degradation reason code
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("windrose_reconcile_errors_total")
        .with_description("Total number of reconcile errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of cloud-side VM operations
///
/// Labels:
/// - `operation`: create, destroy, configure
/// - `result`: success, error
pub static VM_OPERATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("windrose_vm_operations_total")
        .with_description("Total number of cloud-side VM operations")
        .with_unit("{operations}")
        .build()
});

/// Record a VM operation outcome
pub fn record_vm_operation(operation: &'static str, success: bool) {
    let result = if success { "success" } else { "error" };
    VM_OPERATIONS.add(
        1,
        &[
            opentelemetry::KeyValue::new("operation", operation),
            opentelemetry::KeyValue::new("result", result),
        ],
    );
}

/// Update the joined-node and tracked-VM gauges after a reconcile pass
pub fn record_population(joined: u32, tracked: usize) {
    JOINED_MACHINES.record(joined as i64, &[]);
    TRACKED_VMS.record(tracked as i64, &[]);
}

/// Timer guard for recording reconcile duration and outcome
pub struct ReconcileTimer {
    config: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile pass
    pub fn start(config: impl Into<String>) -> Self {
        Self {
            config: config.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                opentelemetry::KeyValue::new("config", self.config),
                opentelemetry::KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion with the degradation reason
    pub fn error(self, reason: crate::error::ReasonCode) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                opentelemetry::KeyValue::new("config", self.config.clone()),
                opentelemetry::KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                opentelemetry::KeyValue::new("config", self.config),
                opentelemetry::KeyValue::new("reason", reason.to_string()),
            ],
        );
    }
}
