//! Prometheus collectors for jobchain, compiled with the `metrics` feature.
//!
//! - `jobchain_jobs_submitted_total{operation}`
//! - `jobchain_jobs_finished_total{operation,status}`
//! - `jobchain_jobs_resubmitted_total{operation}`
//! - `jobchain_dispatch_missing_handler_total{operation}`
//! - `jobchain_job_duration_seconds{operation,status}`
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "jobchain_jobs_submitted_total",
        "Jobs handed to the worker pool or run inline",
    );
    CounterVec::new(opts, &["operation"])
        .expect("jobchain_jobs_submitted_total metric creation failed")
});

pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "jobchain_jobs_finished_total",
        "Jobs that reached a terminal status through dispatch",
    );
    CounterVec::new(opts, &["operation", "status"])
        .expect("jobchain_jobs_finished_total metric creation failed")
});

pub static JOBS_RESUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "jobchain_jobs_resubmitted_total",
        "Re-submissions caused by a running predecessor",
    );
    CounterVec::new(opts, &["operation"])
        .expect("jobchain_jobs_resubmitted_total metric creation failed")
});

pub static DISPATCH_MISSING_HANDLER_TOTAL: LazyLock<CounterVec> =
    LazyLock::new(|| {
        let opts = Opts::new(
            "jobchain_dispatch_missing_handler_total",
            "Dispatches aborted because no handler was registered",
        );
        CounterVec::new(opts, &["operation"])
            .expect("jobchain_dispatch_missing_handler_total creation failed")
    });

pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets =
        exponential_buckets(0.001, 2.0, 18).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "jobchain_job_duration_seconds",
        "Handler execution time in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["operation", "status"])
        .expect("jobchain_job_duration_seconds metric creation failed")
});

/// Registers every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    type Collector = Box<dyn prometheus::core::Collector>;
    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Collector,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(JOBS_RESUBMITTED_TOTAL.clone()),
        Box::new(DISPATCH_MISSING_HANDLER_TOTAL.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_submitted(operation: &str) {
    JOBS_SUBMITTED_TOTAL.with_label_values(&[operation]).inc();
}

pub fn record_job_resubmitted(operation: &str) {
    JOBS_RESUBMITTED_TOTAL.with_label_values(&[operation]).inc();
}

pub fn record_missing_handler(operation: &str) {
    DISPATCH_MISSING_HANDLER_TOTAL
        .with_label_values(&[operation])
        .inc();
}

pub fn record_job_finished(operation: &str, status: &str, duration_secs: f64) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[operation, status])
        .inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[operation, status])
        .observe(duration_secs);
}

/// Renders every registered collector in the Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics().expect("first init");
        init_metrics().expect("second init");
    }

    #[test]
    fn test_gather_includes_recorded_series() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_submitted("2");
        record_job_finished("2", "done", 0.25);
        record_job_resubmitted("2");
        record_missing_handler("9");

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("jobchain_jobs_submitted_total"));
        assert!(output.contains("jobchain_jobs_finished_total"));
        assert!(output.contains("jobchain_job_duration_seconds"));
    }
}
