//! Per-target serialization through dependency chains.
//!
//! A job created while another job with the same target and operation is
//! still active points at it through `dependent_job`. Before running, the job
//! checks that predecessor; if it is still active the job gives up its worker
//! slot and is re-submitted with exponential backoff instead of blocking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::Instrument;

use crate::config::DependencyConfig;
use crate::events::{JobEventBus, JobEventPayload};
use crate::job::{JobId, JobRecord, JobStatus, JobUpdate};
use crate::liveness;
use crate::registry::OperationRegistry;
use crate::store::{self, JobStore};
use crate::telemetry;
use crate::transport::Transport;

/// Re-submission attempts per waiting job. Entries are dropped once the job
/// proceeds or gives up.
#[derive(Clone, Debug, Default)]
pub struct ResubmitLedger {
    inner: Arc<Mutex<HashMap<JobId, u32>>>,
}

impl ResubmitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more attempt and returns the new count.
    pub fn bump(&self, job_id: JobId) -> u32 {
        let mut guard = self.inner.lock();
        let attempts = guard.entry(job_id).or_insert(0);
        *attempts = attempts.saturating_add(1);
        *attempts
    }

    pub fn attempts(&self, job_id: JobId) -> u32 {
        self.inner.lock().get(&job_id).copied().unwrap_or(0)
    }

    pub fn forget(&self, job_id: JobId) {
        self.inner.lock().remove(&job_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Outcome of a readiness check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Readiness {
    /// May start now.
    Ready,
    /// Already `processing` or terminal (including timed out); must not
    /// start again.
    AlreadyStarted(JobStatus),
    /// Predecessor still active; the job was re-submitted.
    Waiting {
        predecessor: JobId,
        attempt: u32,
        delay: Duration,
    },
    /// Predecessor still active after the allowed re-submissions; the job
    /// was moved to `error`.
    GaveUp { predecessor: JobId, attempts: u32 },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

pub struct DependencyResolver {
    store: Arc<dyn JobStore>,
    registry: Arc<OperationRegistry>,
    transport: Arc<dyn Transport>,
    events: JobEventBus,
    config: DependencyConfig,
    timeout: chrono::Duration,
    ledger: ResubmitLedger,
}

impl fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyResolver")
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .field("waiting", &self.ledger.len())
            .finish()
    }
}

impl DependencyResolver {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<OperationRegistry>,
        transport: Arc<dyn Transport>,
        events: JobEventBus,
        config: DependencyConfig,
        timeout: chrono::Duration,
    ) -> Self {
        Self {
            store,
            registry,
            transport,
            events,
            config,
            timeout,
            ledger: ResubmitLedger::new(),
        }
    }

    pub fn ledger(&self) -> &ResubmitLedger {
        &self.ledger
    }

    /// Sets `dependent_job` on a record that has not been stored yet: the
    /// most recently created active job on the same target and operation
    /// inside the timeout window. Parallelizable and untargeted jobs get none.
    pub async fn assign_dependency(
        &self,
        job: &mut JobRecord,
    ) -> anyhow::Result<()> {
        job.dependent_job = None;
        if self.registry.is_parallelizable(job.operation) {
            return Ok(());
        }
        let Some(target) = job.target_key() else {
            return Ok(());
        };

        let since = liveness::window_start(Utc::now(), self.timeout);
        if let Some(predecessor) = self
            .store
            .latest_active(target, job.operation, since)
            .await?
            .filter(|predecessor| predecessor.id != job.id)
        {
            tracing::debug!(
                job_id = %job.id,
                predecessor = %predecessor.id,
                %target,
                "dependency assigned"
            );
            job.dependent_job = Some(predecessor.id);
        }
        Ok(())
    }

    /// The predecessor this job still has to wait for, if any. Missing and
    /// timed-out predecessors do not block.
    pub async fn blocking_predecessor(
        &self,
        job: &JobRecord,
    ) -> anyhow::Result<Option<JobId>> {
        if self.registry.is_parallelizable(job.operation) {
            return Ok(None);
        }
        let Some(predecessor_id) = job.dependent_job else {
            return Ok(None);
        };
        let blocking = self
            .store
            .fetch(predecessor_id)
            .await?
            .is_some_and(|predecessor| {
                !predecessor.is_finished(Utc::now(), self.timeout)
            });
        Ok(blocking.then_some(predecessor_id))
    }

    /// Whether the job's predecessor allows it to run. When it does not, the
    /// job is re-submitted (or failed once out of attempts) before returning.
    pub async fn may_schedule(&self, job: &JobRecord) -> anyhow::Result<bool> {
        Ok(self.schedule(job).await?.is_ready())
    }

    /// [`Self::may_schedule`] guarded against duplicate delivery: a job that is
    /// already `processing` or terminal is never ready.
    pub async fn proceed_if_ready(
        &self,
        job: &JobRecord,
    ) -> anyhow::Result<bool> {
        Ok(self.check(job.id, Some(job)).await?.is_ready())
    }

    /// Full readiness check against the stored version of `job_id`. `fallback`
    /// is used when the record cannot be found.
    pub async fn check(
        &self,
        job_id: JobId,
        fallback: Option<&JobRecord>,
    ) -> anyhow::Result<Readiness> {
        let current = match self.store.fetch(job_id).await? {
            Some(record) => record,
            None => match fallback {
                Some(job) => job.clone(),
                None => anyhow::bail!("job {job_id} not found"),
            },
        };
        let span = telemetry::resolve_span(current.id, current.operation);

        async {
            let status = current.effective_status(Utc::now(), self.timeout);
            if status != JobStatus::Preparing {
                self.ledger.forget(current.id);
                tracing::debug!(%status, "job already started, skipping");
                return Ok(Readiness::AlreadyStarted(status));
            }
            self.schedule(&current).await
        }
        .instrument(span)
        .await
    }

    async fn schedule(&self, job: &JobRecord) -> anyhow::Result<Readiness> {
        let Some(predecessor) = self.blocking_predecessor(job).await? else {
            self.ledger.forget(job.id);
            return Ok(Readiness::Ready);
        };

        let attempt = self.ledger.bump(job.id);
        if self
            .config
            .max_resubmits
            .is_some_and(|max_resubmits| attempt > max_resubmits)
        {
            let attempts = attempt - 1;
            self.ledger.forget(job.id);
            let text = format!(
                "gave up after {attempts} resubmissions \
                 waiting for job {predecessor} to finish"
            );
            tracing::warn!(
                job_id = %job.id,
                %predecessor,
                attempts,
                "dependency wait exhausted"
            );
            store::apply_update(
                self.store.as_ref(),
                &self.registry,
                job.id,
                &JobUpdate::status(JobStatus::Error).with_text(text.clone()),
            )
            .await?;
            self.events.emit(
                job.id,
                job.operation,
                JobEventPayload::Failed { error: text },
            );
            return Ok(Readiness::GaveUp {
                predecessor,
                attempts,
            });
        }

        let damping = self.config.damping_delay();
        if !damping.is_zero() {
            tokio::time::sleep(damping).await;
        }
        let delay = self.config.resubmit_delay(attempt);
        self.transport.submit_after(job.id, delay).await?;

        telemetry::record_job_resubmitted(
            job.id,
            job.operation,
            predecessor,
            attempt,
            delay,
        );
        self.events.emit(
            job.id,
            job.operation,
            JobEventPayload::Deferred {
                predecessor,
                attempt,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            },
        );

        Ok(Readiness::Waiting {
            predecessor,
            attempt,
            delay,
        })
    }
}
