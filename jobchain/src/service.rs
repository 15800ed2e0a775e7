use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use crate::cache::ResultCache;
use crate::error::{CacheError, JobError};
use crate::events::{JobEventBus, JobEventPayload};
use crate::job::{
    JobId, JobParams, JobRecord, JobStatus, JobUpdate, ObjectRef,
    OperationCode, OwnerId, StatusSnapshot, TargetKey, TargetRef,
};
use crate::operation::codes;
use crate::registry::OperationRegistry;
use crate::resolver::DependencyResolver;
use crate::runtime::{Dispatcher, RunMode, RunOutcome};
use crate::store::{self, JobStore};

/// Result of a cancel request on a cancelable job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelOutcome {
    /// Stored as canceled. `signaled` is true when a handler was running in
    /// this process and its token was tripped.
    Canceled { signaled: bool },
    /// Already terminal, including timed out; nothing changed.
    AlreadyFinished(JobStatus),
}

/// Entry point for producers: create, submit, update, cancel and observe jobs.
pub struct JobService {
    store: Arc<dyn JobStore>,
    registry: Arc<OperationRegistry>,
    resolver: Arc<DependencyResolver>,
    dispatcher: Arc<Dispatcher>,
    cache: ResultCache,
    events: JobEventBus,
    timeout: chrono::Duration,
}

impl fmt::Debug for JobService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobService")
            .field("registry", &self.registry)
            .field("cache_dir", &self.cache.dir())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<OperationRegistry>,
        resolver: Arc<DependencyResolver>,
        dispatcher: Arc<Dispatcher>,
        cache: ResultCache,
        events: JobEventBus,
        timeout: chrono::Duration,
    ) -> Self {
        Self {
            store,
            registry,
            resolver,
            dispatcher,
            cache,
            events,
            timeout,
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        &self.resolver
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn events(&self) -> &JobEventBus {
        &self.events
    }

    pub fn timeout(&self) -> chrono::Duration {
        self.timeout
    }

    /// Creates and stores a job in `preparing`, chained to the active job on
    /// the same target and operation when there is one. The operation does
    /// not need a handler yet.
    pub async fn create(
        &self,
        owner: OwnerId,
        target: Option<TargetRef>,
        operation: OperationCode,
        text: impl Into<String>,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        let mut job = JobRecord::new(owner, target, operation, text, params);
        self.resolver.assign_dependency(&mut job).await?;
        self.store.insert(job.clone()).await?;
        tracing::debug!(
            job_id = %job.id,
            %owner,
            %operation,
            dependent_job = ?job.dependent_job,
            "job created"
        );
        Ok(job)
    }

    pub async fn new_create(
        &self,
        owner: OwnerId,
        entry: ObjectRef,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entry(entry)),
            codes::CREATE_ENTRY,
            text,
            params,
        )
        .await
    }

    pub async fn new_edit(
        &self,
        owner: OwnerId,
        entry: ObjectRef,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entry(entry)),
            codes::EDIT_ENTRY,
            text,
            params,
        )
        .await
    }

    pub async fn new_delete(
        &self,
        owner: OwnerId,
        entry: ObjectRef,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entry(entry)),
            codes::DELETE_ENTRY,
            text,
            params,
        )
        .await
    }

    pub async fn new_restore(
        &self,
        owner: OwnerId,
        entry: ObjectRef,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entry(entry)),
            codes::RESTORE_ENTRY,
            text,
            params,
        )
        .await
    }

    /// Parent job of a copy; fans out one `do_copy` job per new entry.
    pub async fn new_copy(
        &self,
        owner: OwnerId,
        entry: ObjectRef,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entry(entry)),
            codes::COPY_ENTRY,
            text,
            params,
        )
        .await
    }

    pub async fn new_do_copy(
        &self,
        owner: OwnerId,
        entry: ObjectRef,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entry(entry)),
            codes::DO_COPY_ENTRY,
            text,
            params,
        )
        .await
    }

    pub async fn new_import(
        &self,
        owner: OwnerId,
        entity: ObjectRef,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entity(entity)),
            codes::IMPORT_ENTRY,
            text,
            params,
        )
        .await
    }

    pub async fn new_import_v2(
        &self,
        owner: OwnerId,
        entity: ObjectRef,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entity(entity)),
            codes::IMPORT_ENTRY_V2,
            text,
            params,
        )
        .await
    }

    pub async fn new_export(
        &self,
        owner: OwnerId,
        entity: Option<ObjectRef>,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            entity.map(TargetRef::Entity),
            codes::EXPORT_ENTRY,
            text,
            params,
        )
        .await
    }

    pub async fn new_export_v2(
        &self,
        owner: OwnerId,
        entity: Option<ObjectRef>,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            entity.map(TargetRef::Entity),
            codes::EXPORT_ENTRY_V2,
            text,
            params,
        )
        .await
    }

    /// Search exports have no single target.
    pub async fn new_export_search_result(
        &self,
        owner: OwnerId,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(owner, None, codes::EXPORT_SEARCH_RESULT, text, params)
            .await
    }

    pub async fn new_export_search_result_v2(
        &self,
        owner: OwnerId,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(owner, None, codes::EXPORT_SEARCH_RESULT_V2, text, params)
            .await
    }

    pub async fn new_register_referrals(
        &self,
        owner: OwnerId,
        entry: ObjectRef,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entry(entry)),
            codes::REGISTER_REFERRALS,
            "",
            JobParams::empty(),
        )
        .await
    }

    pub async fn new_create_entity(
        &self,
        owner: OwnerId,
        entity: ObjectRef,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entity(entity)),
            codes::CREATE_ENTITY,
            text,
            params,
        )
        .await
    }

    pub async fn new_edit_entity(
        &self,
        owner: OwnerId,
        entity: ObjectRef,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entity(entity)),
            codes::EDIT_ENTITY,
            text,
            params,
        )
        .await
    }

    pub async fn new_delete_entity(
        &self,
        owner: OwnerId,
        entity: ObjectRef,
        text: &str,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entity(entity)),
            codes::DELETE_ENTITY,
            text,
            params,
        )
        .await
    }

    pub async fn new_update_document(
        &self,
        owner: OwnerId,
        entry: ObjectRef,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entry(entry)),
            codes::UPDATE_DOCUMENT,
            "",
            params,
        )
        .await
    }

    pub async fn new_notify_create_entry(
        &self,
        owner: OwnerId,
        entry: ObjectRef,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entry(entry)),
            codes::NOTIFY_CREATE_ENTRY,
            "",
            params,
        )
        .await
    }

    pub async fn new_notify_update_entry(
        &self,
        owner: OwnerId,
        entry: ObjectRef,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entry(entry)),
            codes::NOTIFY_UPDATE_ENTRY,
            "",
            params,
        )
        .await
    }

    pub async fn new_notify_delete_entry(
        &self,
        owner: OwnerId,
        entry: ObjectRef,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entry(entry)),
            codes::NOTIFY_DELETE_ENTRY,
            "",
            params,
        )
        .await
    }

    pub async fn new_may_invoke_trigger(
        &self,
        owner: OwnerId,
        entry: ObjectRef,
        params: JobParams,
    ) -> Result<JobRecord, JobError> {
        self.create(
            owner,
            Some(TargetRef::Entry(entry)),
            codes::MAY_INVOKE_TRIGGER,
            "",
            params,
        )
        .await
    }

    /// Hands the job to the worker pool, or runs it inline for `Synchronous`.
    pub async fn submit(
        &self,
        job_id: JobId,
        mode: RunMode,
    ) -> Result<RunOutcome, JobError> {
        let job = self.fetch(job_id).await?;
        Ok(self.dispatcher.run(&job, mode).await?)
    }

    /// Applies the update contract and returns the stored record.
    pub async fn update(
        &self,
        job_id: JobId,
        update: JobUpdate,
    ) -> Result<JobRecord, JobError> {
        let applied = store::apply_update(
            self.store.as_ref(),
            &self.registry,
            job_id,
            &update,
        )
        .await?
        .ok_or(JobError::NotFound(job_id))?;
        Ok(applied.record)
    }

    /// Cancels a job of a cancelable operation. A running handler observes
    /// the request through its token; one still `preparing` never starts.
    pub async fn cancel(
        &self,
        job_id: JobId,
    ) -> Result<CancelOutcome, JobError> {
        let job = self.fetch(job_id).await?;
        if !self.registry.is_cancelable(job.operation) {
            return Err(JobError::NotCancelable(job.operation));
        }

        let now = Utc::now();
        let timeout = self.timeout;
        let registry = &self.registry;
        let mut finished_as = None;
        self.store
            .modify(job_id, &mut |record: &mut JobRecord| {
                let status = record.effective_status(now, timeout);
                if status.is_terminal() {
                    finished_as = Some(status);
                } else {
                    record.apply_update(
                        &JobUpdate::status(JobStatus::Canceled),
                        |code| registry.is_known(code),
                        now,
                    );
                }
            })
            .await?
            .ok_or(JobError::NotFound(job_id))?;

        if let Some(status) = finished_as {
            return Ok(CancelOutcome::AlreadyFinished(status));
        }

        let signaled = self.dispatcher.cancellations().cancel(job_id);
        self.events
            .emit(job_id, job.operation, JobEventPayload::Canceled);
        tracing::info!(
            %job_id,
            operation = %job.operation,
            signaled,
            "job canceled"
        );
        Ok(CancelOutcome::Canceled { signaled })
    }

    pub async fn fetch(&self, job_id: JobId) -> Result<JobRecord, JobError> {
        self.store
            .fetch(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    /// Read model with the timeout-adjusted status.
    pub async fn status_snapshot(
        &self,
        job_id: JobId,
    ) -> Result<StatusSnapshot, JobError> {
        Ok(self.fetch(job_id).await?.snapshot(Utc::now(), self.timeout))
    }

    pub async fn is_finished(&self, job_id: JobId) -> Result<bool, JobError> {
        Ok(self.fetch(job_id).await?.is_finished(Utc::now(), self.timeout))
    }

    pub async fn is_canceled(&self, job_id: JobId) -> Result<bool, JobError> {
        Ok(self.fetch(job_id).await?.is_canceled())
    }

    pub async fn is_timeout(&self, job_id: JobId) -> Result<bool, JobError> {
        Ok(self.fetch(job_id).await?.is_timeout(Utc::now(), self.timeout))
    }

    /// Jobs of `owner` submitted with identical params, newest first.
    pub async fn find_duplicates(
        &self,
        owner: OwnerId,
        params: &JobParams,
    ) -> Result<Vec<JobRecord>, JobError> {
        Ok(self.store.find_by_owner_params(owner, params).await?)
    }

    /// Whether an unfinished job with the same owner, operation and params
    /// exists.
    pub async fn has_pending_duplicate(
        &self,
        owner: OwnerId,
        operation: OperationCode,
        params: &JobParams,
    ) -> Result<bool, JobError> {
        let now = Utc::now();
        Ok(self
            .find_duplicates(owner, params)
            .await?
            .iter()
            .any(|job| {
                job.operation == operation
                    && !job.is_finished(now, self.timeout)
            }))
    }

    /// Newest jobs of an owner as snapshots. Hidden operations are left out
    /// unless `include_hidden` is set.
    pub async fn recent_jobs(
        &self,
        owner: OwnerId,
        limit: usize,
        include_hidden: bool,
    ) -> Result<Vec<StatusSnapshot>, JobError> {
        let excluded = if include_hidden {
            Vec::new()
        } else {
            self.registry.hidden_codes()
        };
        let now = Utc::now();
        Ok(self
            .store
            .list_by_owner(owner, limit, &excluded)
            .await?
            .iter()
            .map(|job| job.snapshot(now, self.timeout))
            .collect())
    }

    /// Called by producers when a target object is destroyed; affected jobs
    /// keep running with a null target.
    pub async fn detach_target(
        &self,
        target: TargetKey,
    ) -> Result<u64, JobError> {
        let detached = self.store.detach_target(target).await?;
        tracing::debug!(%target, detached, "target detached from jobs");
        Ok(detached)
    }

    pub async fn set_cache(
        &self,
        job_id: JobId,
        bytes: &[u8],
    ) -> Result<(), CacheError> {
        self.cache.set(job_id, bytes).await
    }

    pub async fn get_cache(
        &self,
        job_id: JobId,
    ) -> Result<Vec<u8>, CacheError> {
        self.cache.get(job_id).await
    }
}
