//! Prometheus counters for sync and export runs.
//!
//! The engine runs as a short-lived job, so the registry is not scraped.
//! The binary dumps it at debug level once a command finishes.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Download metrics
pub static KEYS_DOWNLOADED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keyrelay_keys_downloaded_total",
            "Keys inserted from federation sources",
        ),
        &["source"],
    )
    .expect("metric creation failed")
});

pub static KEYS_FILTERED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keyrelay_keys_filtered_total",
            "Downloaded keys dropped because of their report type",
        ),
        &["source"],
    )
    .expect("metric creation failed")
});

pub static BATCHES_REJECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keyrelay_batches_rejected_total",
            "Downloaded batches rejected for malformed key material",
        ),
        &["source"],
    )
    .expect("metric creation failed")
});

// Upload metrics
pub static KEYS_UPLOADED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keyrelay_keys_uploaded_total",
            "Local keys pushed to federation destinations",
        ),
        &["destination"],
    )
    .expect("metric creation failed")
});

// Export metrics
pub static KEYS_DEFERRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keyrelay_keys_deferred_total",
        "Still-valid keys re-queued for a later export",
    )
    .expect("metric creation failed")
});

pub static EXPORT_FILES_GENERATED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keyrelay_export_files_generated_total",
            "Export archives written",
        ),
        &["region"],
    )
    .expect("metric creation failed")
});

pub static EXPORT_FILES_REMOVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keyrelay_export_files_removed_total",
        "Export archives removed by retention cleanup",
    )
    .expect("metric creation failed")
});

// Job metrics
pub static SYNC_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keyrelay_sync_failures_total",
            "Aborted sources and destinations by job and error kind",
        ),
        &["job", "kind"],
    )
    .expect("metric creation failed")
});

pub static JOB_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new("keyrelay_job_duration_seconds", "Job duration by job")
            .buckets(vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]),
        &["job"],
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent: calls after the first are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(KEYS_DOWNLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(KEYS_FILTERED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BATCHES_REJECTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(KEYS_UPLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(KEYS_DEFERRED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(EXPORT_FILES_GENERATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(EXPORT_FILES_REMOVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SYNC_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOB_DURATION.clone()))
            .expect("metric registration failed");
    });
}

/// Text exposition of the registry.
pub fn encode_metrics() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Count an aborted source or destination.
pub fn record_sync_failure(job: &str, kind: crate::error::ErrorKind) {
    SYNC_FAILURES.with_label_values(&[job, kind.as_str()]).inc();
}
