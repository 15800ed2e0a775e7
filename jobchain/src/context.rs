use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;

use crate::cache::ResultCache;
use crate::error::CacheError;
use crate::job::{JobId, JobParams, JobRecord, JobStatus, JobUpdate};
use crate::registry::OperationRegistry;
use crate::store::{self, JobStore};

/// Cooperative cancellation flag handed to a running handler.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelTokenInner>,
}

#[derive(Debug, Default)]
struct CancelTokenInner {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn canceled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_canceled() {
            return;
        }
        notified.await;
    }
}

/// Tokens of jobs currently running in this process.
#[derive(Clone, Debug, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<JobId, CancelToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token_for(&self, job_id: JobId) -> CancelToken {
        self.tokens.lock().entry(job_id).or_default().clone()
    }

    /// Trips the token of a running job. Returns whether one was running here.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.tokens.lock().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn release(&self, job_id: JobId) {
        self.tokens.lock().remove(&job_id);
    }

    pub fn running(&self) -> usize {
        self.tokens.lock().len()
    }
}

/// What a handler gets: the job as it was when execution started, plus
/// access to the update contract, cancellation and the result cache.
#[derive(Clone)]
pub struct JobContext {
    job: JobRecord,
    store: Arc<dyn JobStore>,
    registry: Arc<OperationRegistry>,
    cache: ResultCache,
    cancel: CancelToken,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("operation", &self.job.operation)
            .field("canceled", &self.cancel.is_canceled())
            .finish()
    }
}

impl JobContext {
    pub fn new(
        job: JobRecord,
        store: Arc<dyn JobStore>,
        registry: Arc<OperationRegistry>,
        cache: ResultCache,
        cancel: CancelToken,
    ) -> Self {
        Self {
            job,
            store,
            registry,
            cache,
            cancel,
        }
    }

    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn params(&self) -> &JobParams {
        &self.job.params
    }

    pub fn parse_params<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(self.job.params.parse()?)
    }

    /// Checks the in-process token. Cheap enough for tight loops.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Re-reads the stored status, catching cancellation issued by another
    /// process. Trips the local token when the job was canceled.
    pub async fn refresh_canceled(&self) -> anyhow::Result<bool> {
        if self.cancel.is_canceled() {
            return Ok(true);
        }
        let canceled = self
            .store
            .fetch(self.job.id)
            .await?
            .is_some_and(|record| record.status == JobStatus::Canceled);
        if canceled {
            self.cancel.cancel();
        }
        Ok(canceled)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Applies the update contract to this job and returns the stored result.
    pub async fn update(
        &self,
        update: JobUpdate,
    ) -> anyhow::Result<Option<JobRecord>> {
        let applied = store::apply_update(
            self.store.as_ref(),
            &self.registry,
            self.job.id,
            &update,
        )
        .await?;
        Ok(applied.map(|applied| applied.record))
    }

    /// Replaces the progress text, which also counts as a liveness heartbeat.
    pub async fn set_text(
        &self,
        text: impl Into<String>,
    ) -> anyhow::Result<()> {
        self.update(JobUpdate::new().with_text(text)).await?;
        Ok(())
    }

    pub async fn set_cache(&self, bytes: &[u8]) -> Result<(), CacheError> {
        self.cache.set(self.job.id, bytes).await
    }
}
