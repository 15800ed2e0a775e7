//! Tracing spans and lifecycle recorders for jobchain.
//!
//! The `record_*` helpers always log through `tracing` and, with the
//! `metrics` feature enabled, also update the Prometheus collectors in
//! [`crate::metrics`].

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{Instrument, Span, info_span};

use crate::job::{JobId, JobStatus, OperationCode};

/// Span around one execution attempt of a job.
#[must_use]
pub fn dispatch_span(job_id: JobId, operation: OperationCode) -> Span {
    info_span!("jobchain.dispatch", %job_id, %operation)
}

/// Span around a dependency check.
#[must_use]
pub fn resolve_span(job_id: JobId, operation: OperationCode) -> Span {
    info_span!("jobchain.resolve", %job_id, %operation)
}

/// Span around handing a job to the worker pool or running it inline.
#[must_use]
pub fn submit_span(
    job_id: JobId,
    operation: OperationCode,
    mode: &'static str,
) -> Span {
    info_span!("jobchain.submit", %job_id, %operation, mode)
}

pub fn instrument_dispatch<F>(
    job_id: JobId,
    operation: OperationCode,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(job_id, operation))
}

pub fn record_job_submitted(job_id: JobId, operation: OperationCode) {
    tracing::info!(%job_id, %operation, "job submitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted(&operation.to_string());
}

pub fn record_job_resubmitted(
    job_id: JobId,
    operation: OperationCode,
    predecessor: JobId,
    attempt: u32,
    delay: Duration,
) {
    tracing::debug!(
        %job_id,
        %operation,
        %predecessor,
        attempt,
        delay_ms = delay.as_millis() as u64,
        "predecessor still running, job resubmitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_resubmitted(&operation.to_string());
}

pub fn record_missing_handler(job_id: JobId, operation: OperationCode) {
    tracing::error!(
        %job_id,
        %operation,
        "no handler registered for operation, job left as is"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_missing_handler(&operation.to_string());
}

/// Starts timing an execution; pass the handle to [`record_job_finished`].
pub fn record_job_start(job_id: JobId) -> JobTimingHandle {
    JobTimingHandle {
        job_id,
        start: Instant::now(),
    }
}

pub fn record_job_finished(
    handle: JobTimingHandle,
    operation: OperationCode,
    status: JobStatus,
) {
    let elapsed = handle.elapsed();
    tracing::info!(
        job_id = %handle.job_id,
        %operation,
        %status,
        duration_ms = elapsed.as_millis() as u64,
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(
        &operation.to_string(),
        status.as_str(),
        elapsed.as_secs_f64(),
    );
}

#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: JobId,
    start: Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
