//! Prometheus metrics instrumentation for archivist.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `archivist_events_handled_total` - Inbound messages by kind and outcome
//! - `archivist_sip_transitions_total` - SIP state changes
//! - `archivist_aips_submitted_total` - AIPs sent to storage, by result
//! - `archivist_deletion_rejections_total` - SIPs the storage service refused to delete
//!
//! ## Histograms
//! - `archivist_sweep_duration_seconds` - Bulk sweep duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for archivist metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `tenant`, `kind` (aip, job, broadcast), `outcome`.
pub static EVENTS_HANDLED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "archivist_events_handled_total",
        "Total number of inbound messages handled",
    );
    CounterVec::new(opts, &["tenant", "kind", "outcome"])
        .expect("archivist_events_handled_total metric creation failed")
});

/// Labels: `tenant`, `from`, `to`.
pub static SIP_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "archivist_sip_transitions_total",
        "Total number of SIP state changes",
    );
    CounterVec::new(opts, &["tenant", "from", "to"])
        .expect("archivist_sip_transitions_total metric creation failed")
});

/// Labels: `tenant`, `result` (accepted, rejected).
pub static AIPS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "archivist_aips_submitted_total",
        "Total number of AIPs submitted to the storage service",
    );
    CounterVec::new(opts, &["tenant", "result"])
        .expect("archivist_aips_submitted_total metric creation failed")
});

pub static DELETION_REJECTIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "archivist_deletion_rejections_total",
        "Total number of SIP deletions refused by the storage service",
    );
    CounterVec::new(opts, &["tenant"])
        .expect("archivist_deletion_rejections_total metric creation failed")
});

/// Labels: `tenant`, `sweep` (submission, deletion), `status`.
pub static SWEEP_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 18).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "archivist_sweep_duration_seconds",
        "Bulk sweep duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["tenant", "sweep", "status"])
        .expect("archivist_sweep_duration_seconds metric creation failed")
});

/// Register every metric with the global registry. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(EVENTS_HANDLED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(SIP_TRANSITIONS_TOTAL.clone()),
        Box::new(AIPS_SUBMITTED_TOTAL.clone()),
        Box::new(DELETION_REJECTIONS_TOTAL.clone()),
        Box::new(SWEEP_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_event_handled(tenant: &str, kind: &str, outcome: &str) {
    EVENTS_HANDLED_TOTAL
        .with_label_values(&[tenant, kind, outcome])
        .inc();
}

pub fn record_sip_transition(tenant: &str, from: &str, to: &str) {
    SIP_TRANSITIONS_TOTAL
        .with_label_values(&[tenant, from, to])
        .inc();
}

pub fn record_aips_submitted(tenant: &str, accepted: usize, rejected: usize) {
    AIPS_SUBMITTED_TOTAL
        .with_label_values(&[tenant, "accepted"])
        .inc_by(accepted as f64);
    AIPS_SUBMITTED_TOTAL
        .with_label_values(&[tenant, "rejected"])
        .inc_by(rejected as f64);
}

pub fn record_deletion_rejections(tenant: &str, rejected: usize) {
    DELETION_REJECTIONS_TOTAL
        .with_label_values(&[tenant])
        .inc_by(rejected as f64);
}

pub fn observe_sweep_duration(tenant: &str, sweep: &str, status: &str, duration_secs: f64) {
    SWEEP_DURATION_SECONDS
        .with_label_values(&[tenant, sweep, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
