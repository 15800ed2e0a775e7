use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::{JobId, OperationCode, OwnerId};

/// Details of a handler failure, sent to operators out of band.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job_id: JobId,
    pub owner: OwnerId,
    pub operation: OperationCode,
    pub detail: String,
    /// The handler panicked instead of returning an error.
    pub panicked: bool,
}

/// Out-of-band channel for handler failures (mail, chat, paging).
#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn notify_failure(&self, failure: &JobFailure) -> anyhow::Result<()>;
}

/// Default notifier that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl OperatorNotifier for TracingNotifier {
    async fn notify_failure(&self, failure: &JobFailure) -> anyhow::Result<()> {
        tracing::error!(
            job_id = %failure.job_id,
            owner = %failure.owner,
            operation = %failure.operation,
            panicked = failure.panicked,
            detail = %failure.detail,
            "job handler failed"
        );
        Ok(())
    }
}
