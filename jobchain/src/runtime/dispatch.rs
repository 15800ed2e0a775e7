use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::Instrument;

use crate::cache::ResultCache;
use crate::context::{CancellationRegistry, JobContext};
use crate::events::{JobEventBus, JobEventPayload};
use crate::job::{JobId, JobRecord, JobStatus, JobUpdate};
use crate::notify::{JobFailure, OperatorNotifier};
use crate::operation::{JobHandler, JobOutcome};
use crate::registry::OperationRegistry;
use crate::resolver::{DependencyResolver, Readiness};
use crate::store::JobStore;
use crate::telemetry;
use crate::transport::Transport;

/// How [`Dispatcher::run`] should execute a job.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RunMode {
    /// Hand the job id to the worker pool.
    #[default]
    Asynchronous,
    /// Execute on the caller's task and wait for the result.
    Synchronous,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Asynchronous => "async",
            RunMode::Synchronous => "sync",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    Submitted,
    Executed(ExecutionReport),
    /// No handler is registered; the job was left untouched.
    HandlerMissing,
}

/// What one execution attempt did. Execution never fails outward.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecutionReport {
    JobMissing,
    HandlerMissing,
    /// Not started: already running or finished, or waiting on a predecessor.
    NotReady(Readiness),
    /// The handler ran and the job ended with `status`.
    Finished { status: JobStatus },
    /// The store could not be read or written.
    StoreFailed { error: String },
}

/// Runs handlers for job ids under the dependency and status rules.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<OperationRegistry>,
    resolver: Arc<DependencyResolver>,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn OperatorNotifier>,
    events: JobEventBus,
    cache: ResultCache,
    cancellations: CancellationRegistry,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("resolver", &self.resolver)
            .field("running", &self.cancellations.running())
            .finish()
    }
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<OperationRegistry>,
        resolver: Arc<DependencyResolver>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn OperatorNotifier>,
        events: JobEventBus,
        cache: ResultCache,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            store,
            registry,
            resolver,
            transport,
            notifier,
            events,
            cache,
            cancellations,
        }
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Looks up the handler and submits or executes the job. A missing
    /// handler is logged and reported, never raised.
    pub async fn run(
        &self,
        job: &JobRecord,
        mode: RunMode,
    ) -> anyhow::Result<RunOutcome> {
        let span = telemetry::submit_span(job.id, job.operation, mode.as_str());
        self.run_in_mode(job, mode).instrument(span).await
    }

    async fn run_in_mode(
        &self,
        job: &JobRecord,
        mode: RunMode,
    ) -> anyhow::Result<RunOutcome> {
        if self.registry.handler_for(job.operation).is_none() {
            self.report_missing_handler(job);
            return Ok(RunOutcome::HandlerMissing);
        }

        telemetry::record_job_submitted(job.id, job.operation);
        match mode {
            RunMode::Asynchronous => {
                self.transport.submit(job.id).await?;
                self.events
                    .emit(job.id, job.operation, JobEventPayload::Submitted);
                Ok(RunOutcome::Submitted)
            }
            RunMode::Synchronous => {
                Ok(RunOutcome::Executed(self.execute(job.id).await))
            }
        }
    }

    /// One execution attempt: readiness check, claim, handler, outcome.
    pub async fn execute(&self, job_id: JobId) -> ExecutionReport {
        let job = match self.store.fetch(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(
                    %job_id,
                    "job delivered for execution no longer exists"
                );
                return ExecutionReport::JobMissing;
            }
            Err(err) => return store_failed(job_id, err),
        };

        let (id, operation) = (job.id, job.operation);
        let run = self.execute_job(job);
        telemetry::instrument_dispatch(id, operation, run).await
    }

    async fn execute_job(&self, job: JobRecord) -> ExecutionReport {
        let Some(handler) = self.registry.handler_for(job.operation) else {
            self.report_missing_handler(&job);
            return ExecutionReport::HandlerMissing;
        };

        match self.resolver.check(job.id, Some(&job)).await {
            Ok(Readiness::Ready) => {}
            Ok(readiness) => return ExecutionReport::NotReady(readiness),
            Err(err) => return store_failed(job.id, err),
        }

        // Registered before the claim so a racing cancel still trips it.
        let token = self.cancellations.token_for(job.id);
        let claimed = match self.claim(job.id).await {
            Ok(Ok(record)) => record,
            Ok(Err(status)) => {
                self.cancellations.release(job.id);
                return ExecutionReport::NotReady(Readiness::AlreadyStarted(
                    status,
                ));
            }
            Err(err) => {
                self.cancellations.release(job.id);
                return store_failed(job.id, err);
            }
        };

        self.events
            .emit(job.id, job.operation, JobEventPayload::Started);
        let timing = telemetry::record_job_start(job.id);

        let ctx = JobContext::new(
            claimed.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.cache.clone(),
            token,
        );
        let result = run_contained(handler, ctx).await;
        self.cancellations.release(job.id);

        let status = match result {
            Ok(outcome) => self.apply_outcome(&claimed, outcome).await,
            Err(failure) => self.apply_failure(&claimed, failure).await,
        };

        match status {
            Ok(status) => {
                telemetry::record_job_finished(timing, job.operation, status);
                ExecutionReport::Finished { status }
            }
            Err(err) => store_failed(job.id, err),
        }
    }

    /// Moves a `preparing` job to `processing` in one store round trip.
    /// Returns the current status instead when another worker got there first
    /// or the job was canceled in between.
    async fn claim(
        &self,
        job_id: JobId,
    ) -> anyhow::Result<Result<JobRecord, JobStatus>> {
        let now = Utc::now();
        let registry = &self.registry;
        let mut claimed = false;
        let record = self
            .store
            .modify(job_id, &mut |record: &mut JobRecord| {
                if record.status == JobStatus::Preparing {
                    record.apply_update(
                        &JobUpdate::status(JobStatus::Processing),
                        |code| registry.is_known(code),
                        now,
                    );
                    claimed = true;
                }
            })
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("job {job_id} disappeared while claiming")
            })?;

        Ok(if claimed { Ok(record) } else { Err(record.status) })
    }

    async fn apply_outcome(
        &self,
        job: &JobRecord,
        outcome: JobOutcome,
    ) -> anyhow::Result<JobStatus> {
        let (status, note) = match outcome {
            JobOutcome::Done => (JobStatus::Done, None),
            JobOutcome::Warning(message) => (JobStatus::Warning, Some(message)),
            JobOutcome::Canceled => (JobStatus::Canceled, None),
        };
        let record = self.finish(job.id, status, note).await?;
        self.events.emit(
            job.id,
            job.operation,
            JobEventPayload::Finished {
                status: record.status,
            },
        );
        Ok(record.status)
    }

    async fn apply_failure(
        &self,
        job: &JobRecord,
        failure: HandlerFailure,
    ) -> anyhow::Result<JobStatus> {
        let record = self
            .finish(job.id, JobStatus::Error, Some(failure.detail.clone()))
            .await?;

        let report = JobFailure {
            job_id: job.id,
            owner: job.owner,
            operation: job.operation,
            detail: failure.detail.clone(),
            panicked: failure.panicked,
        };
        if let Err(err) = self.notifier.notify_failure(&report).await {
            tracing::warn!(
                job_id = %job.id,
                error = %err,
                "operator notification failed"
            );
        }

        self.events.emit(
            job.id,
            job.operation,
            JobEventPayload::Failed {
                error: failure.detail,
            },
        );
        Ok(record.status)
    }

    /// Writes the final status, appending `note` to the current text. A job
    /// that is already terminal (for example canceled while running) keeps
    /// its status.
    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        note: Option<String>,
    ) -> anyhow::Result<JobRecord> {
        let now = Utc::now();
        let registry = &self.registry;
        self.store
            .modify(job_id, &mut |record: &mut JobRecord| {
                let mut update = JobUpdate::status(status);
                if let Some(note) = &note {
                    update = update.with_text(append_line(&record.text, note));
                }
                record.apply_update(
                    &update,
                    |code| registry.is_known(code),
                    now,
                );
            })
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("job {job_id} disappeared while finishing")
            })
    }

    fn report_missing_handler(&self, job: &JobRecord) {
        telemetry::record_missing_handler(job.id, job.operation);
        self.events
            .emit(job.id, job.operation, JobEventPayload::HandlerMissing);
    }
}

struct HandlerFailure {
    detail: String,
    panicked: bool,
}

/// Runs the handler on its own task so a panic is contained and reported as
/// a failure.
async fn run_contained(
    handler: Arc<dyn JobHandler>,
    ctx: JobContext,
) -> Result<JobOutcome, HandlerFailure> {
    let run = async move { handler.run(ctx).await };
    let task = tokio::spawn(run.instrument(tracing::Span::current()));
    match task.await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(err)) => Err(HandlerFailure {
            detail: format!("{err:#}"),
            panicked: false,
        }),
        Err(join_err) if join_err.is_panic() => Err(HandlerFailure {
            detail: format!(
                "handler panicked: {}",
                panic_message(join_err.into_panic())
            ),
            panicked: true,
        }),
        Err(join_err) => Err(HandlerFailure {
            detail: format!("handler task aborted: {join_err}"),
            panicked: false,
        }),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn append_line(text: &str, line: &str) -> String {
    if text.is_empty() {
        line.to_string()
    } else {
        format!("{text}\n{line}")
    }
}

fn store_failed(job_id: JobId, err: anyhow::Error) -> ExecutionReport {
    tracing::error!(%job_id, error = %err, "job store failure during dispatch");
    ExecutionReport::StoreFailed {
        error: format!("{err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_line() {
        assert_eq!(append_line("", "boom"), "boom");
        assert_eq!(append_line("50%", "boom"), "50%\nboom");
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42_u8)), "unknown panic payload");
    }
}
