use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobchain::*;
use parking_lot::Mutex;

/// One call to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub job_id: JobId,
    /// `None` for [`Transport::submit`].
    pub delay: Option<Duration>,
}

/// Transport that records submissions instead of delivering them.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    submissions: Arc<Mutex<Vec<Submission>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub fn resubmissions_of(&self, job_id: JobId) -> usize {
        self.submissions
            .lock()
            .iter()
            .filter(|s| s.job_id == job_id && s.delay.is_some())
            .count()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<Submission> {
        std::mem::take(&mut *self.submissions.lock())
    }

    pub fn assert_submission_count_eq(&self, expected: usize) {
        let actual = self.submissions.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} submissions, got {}",
            expected, actual
        );
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn submit(&self, job_id: JobId) -> anyhow::Result<()> {
        self.submissions.lock().push(Submission {
            job_id,
            delay: None,
        });
        Ok(())
    }

    async fn submit_after(
        &self,
        job_id: JobId,
        delay: Duration,
    ) -> anyhow::Result<()> {
        self.submissions.lock().push(Submission {
            job_id,
            delay: Some(delay),
        });
        Ok(())
    }
}

/// Notifier that keeps every failure report.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    failures: Arc<Mutex<Vec<JobFailure>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<JobFailure> {
        self.failures.lock().clone()
    }
}

#[async_trait]
impl OperatorNotifier for RecordingNotifier {
    async fn notify_failure(&self, failure: &JobFailure) -> anyhow::Result<()> {
        self.failures.lock().push(failure.clone());
        Ok(())
    }
}
