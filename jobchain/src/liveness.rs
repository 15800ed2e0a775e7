//! Derived liveness: a job that stopped reporting progress reads as timed out.

use chrono::{DateTime, Duration, Utc};

use crate::job::JobStatus;

/// Reported status for a stored status and last-activity time.
///
/// Only non-terminal statuses can be reported as [`JobStatus::Timeout`]; the
/// stored value is never rewritten.
pub fn effective_status(
    stored: JobStatus,
    updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> JobStatus {
    if !stored.is_terminal() && is_stale(updated_at, now, timeout) {
        JobStatus::Timeout
    } else {
        stored
    }
}

/// Whether `updated_at` is older than the timeout window.
pub fn is_stale(
    updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> bool {
    now - updated_at > timeout
}

/// Earliest `updated_at` a record may have and still be inside the window.
/// Saturates at the earliest representable time.
pub fn window_start(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(timeout)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
