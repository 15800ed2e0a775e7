use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::job::{
    JobId, JobParams, JobRecord, JobUpdate, OperationCode, OwnerId, TargetKey,
    UpdateEffect,
};
use crate::registry::OperationRegistry;

/// Persistence backend for job records.
///
/// Implementors only store and query; status rules live in
/// [`JobRecord::apply_update`], which callers run through [`JobStore::modify`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly created record.
    async fn insert(&self, record: JobRecord) -> anyhow::Result<()>;

    /// Load the latest stored version of a record.
    async fn fetch(&self, id: JobId) -> anyhow::Result<Option<JobRecord>>;

    /// Atomically read, mutate and write back a record. Returns the stored
    /// result, or `None` if the record does not exist.
    async fn modify(
        &self,
        id: JobId,
        mutate: &mut (dyn for<'r> FnMut(&'r mut JobRecord) + Send),
    ) -> anyhow::Result<Option<JobRecord>>;

    /// Most recently created record for `target` and `operation` whose
    /// stored status is non-terminal and whose `updated_at` is not before
    /// `since`.
    ///
    /// Candidates are ordered by `created_at` descending; ties go to the
    /// later `updated_at`, then to the greater `id`.
    async fn latest_active(
        &self,
        target: TargetKey,
        operation: OperationCode,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Option<JobRecord>>;

    /// Records with exactly these params, newest first.
    async fn find_by_owner_params(
        &self,
        owner: OwnerId,
        params: &JobParams,
    ) -> anyhow::Result<Vec<JobRecord>>;

    /// Newest records of an owner, skipping the excluded operations.
    async fn list_by_owner(
        &self,
        owner: OwnerId,
        limit: usize,
        exclude_operations: &[OperationCode],
    ) -> anyhow::Result<Vec<JobRecord>>;

    /// Clears the target of every record pointing at `target`. Returns the
    /// number of records touched.
    async fn detach_target(&self, target: TargetKey) -> anyhow::Result<u64>;
}

/// Result of running the update contract against the store.
#[derive(Clone, Debug)]
pub struct AppliedUpdate {
    pub record: JobRecord,
    pub effect: UpdateEffect,
}

/// Runs [`JobRecord::apply_update`] inside [`JobStore::modify`], so the rules
/// are evaluated against the latest stored version.
pub async fn apply_update(
    store: &dyn JobStore,
    registry: &OperationRegistry,
    id: JobId,
    update: &JobUpdate,
) -> anyhow::Result<Option<AppliedUpdate>> {
    let now = Utc::now();
    let mut effect = None;
    let record = store
        .modify(id, &mut |record: &mut JobRecord| {
            let known = |code| registry.is_known(code);
            effect = Some(record.apply_update(update, known, now));
        })
        .await?;
    Ok(record.map(|record| AppliedUpdate {
        record,
        effect: effect.unwrap_or_default(),
    }))
}

/// Process-local store. Records live as long as the store.
#[derive(Default)]
pub struct InMemoryJobStore {
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("records", &self.records.read().len())
            .finish()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn all(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> =
            self.records.read().values().cloned().collect();
        records.sort_by(|a, b| newest_first(a, b));
        records
    }
}

fn newest_first(a: &JobRecord, b: &JobRecord) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| b.id.cmp(&a.id))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, record: JobRecord) -> anyhow::Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            anyhow::bail!("job {} already exists", record.id);
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn fetch(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn modify(
        &self,
        id: JobId,
        mutate: &mut (dyn for<'r> FnMut(&'r mut JobRecord) + Send),
    ) -> anyhow::Result<Option<JobRecord>> {
        let mut records = self.records.write();
        Ok(records.get_mut(&id).map(|record| {
            mutate(record);
            record.clone()
        }))
    }

    async fn latest_active(
        &self,
        target: TargetKey,
        operation: OperationCode,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Option<JobRecord>> {
        let records = self.records.read();
        Ok(records
            .values()
            .filter(|record| {
                record.operation == operation
                    && record.target_key() == Some(target)
                    && !record.status.is_terminal()
                    && record.updated_at >= since
            })
            .min_by(|a, b| newest_first(a, b))
            .cloned())
    }

    async fn find_by_owner_params(
        &self,
        owner: OwnerId,
        params: &JobParams,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let mut matches: Vec<JobRecord> = self
            .records
            .read()
            .values()
            .filter(|record| record.owner == owner && &record.params == params)
            .cloned()
            .collect();
        matches.sort_by(newest_first);
        Ok(matches)
    }

    async fn list_by_owner(
        &self,
        owner: OwnerId,
        limit: usize,
        exclude_operations: &[OperationCode],
    ) -> anyhow::Result<Vec<JobRecord>> {
        let mut matches: Vec<JobRecord> = self
            .records
            .read()
            .values()
            .filter(|record| {
                record.owner == owner
                    && !exclude_operations.contains(&record.operation)
            })
            .cloned()
            .collect();
        matches.sort_by(newest_first);
        matches.truncate(limit);
        Ok(matches)
    }

    async fn detach_target(&self, target: TargetKey) -> anyhow::Result<u64> {
        let mut records = self.records.write();
        let mut touched = 0;
        for record in records.values_mut() {
            if record.target_key() == Some(target) {
                record.target = None;
                touched += 1;
            }
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, ObjectRef, TargetRef};
    use crate::operation::codes;
    use chrono::Duration;

    fn job_on(target: i64, operation: OperationCode) -> JobRecord {
        JobRecord::new(
            OwnerId(7),
            Some(TargetRef::Entry(ObjectRef::new(target, "vm-01"))),
            operation,
            "",
            JobParams::empty(),
        )
    }

    #[tokio::test]
    async fn test_latest_active_prefers_newest_non_terminal() {
        let store = InMemoryJobStore::new();
        let first = job_on(1, codes::EDIT_ENTRY);
        let mut second = job_on(1, codes::EDIT_ENTRY);
        second.created_at = first.created_at + Duration::milliseconds(5);
        let mut finished = job_on(1, codes::EDIT_ENTRY);
        finished.created_at = first.created_at + Duration::milliseconds(10);
        finished.status = JobStatus::Done;
        let other_op = job_on(1, codes::DELETE_ENTRY);

        for record in [first.clone(), second.clone(), finished, other_op] {
            store.insert(record).await.unwrap();
        }

        let target = first.target_key().unwrap();
        let since = Utc::now() - Duration::hours(1);
        let latest = store
            .latest_active(target, codes::EDIT_ENTRY, since)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[tokio::test]
    async fn test_latest_active_breaks_ties_on_updated_at_then_id() {
        let store = InMemoryJobStore::new();
        let first = job_on(1, codes::EDIT_ENTRY);
        let mut touched = job_on(1, codes::EDIT_ENTRY);
        touched.created_at = first.created_at;
        touched.updated_at = first.updated_at + Duration::milliseconds(5);
        let mut twin = touched.clone();
        twin.id = JobId::new();

        let target = first.target_key().unwrap();
        let since = Utc::now() - Duration::hours(1);
        store.insert(first.clone()).await.unwrap();
        store.insert(touched.clone()).await.unwrap();
        let latest = store
            .latest_active(target, codes::EDIT_ENTRY, since)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, touched.id);

        store.insert(twin.clone()).await.unwrap();
        let latest = store
            .latest_active(target, codes::EDIT_ENTRY, since)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, touched.id.max(twin.id));
    }

    #[tokio::test]
    async fn test_latest_active_ignores_records_outside_window() {
        let store = InMemoryJobStore::new();
        let mut stale = job_on(1, codes::EDIT_ENTRY);
        stale.updated_at = Utc::now() - Duration::days(2);
        let target = stale.target_key().unwrap();
        store.insert(stale).await.unwrap();

        let since = Utc::now() - Duration::days(1);
        assert!(
            store
                .latest_active(target, codes::EDIT_ENTRY, since)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_detach_target_clears_references() {
        let store = InMemoryJobStore::new();
        let a = job_on(1, codes::EDIT_ENTRY);
        let b = job_on(2, codes::EDIT_ENTRY);
        let target = a.target_key().unwrap();
        store.insert(a.clone()).await.unwrap();
        store.insert(b.clone()).await.unwrap();

        assert_eq!(store.detach_target(target).await.unwrap(), 1);
        assert!(store.fetch(a.id).await.unwrap().unwrap().target.is_none());
        assert!(store.fetch(b.id).await.unwrap().unwrap().target.is_some());
    }

    #[tokio::test]
    async fn test_apply_update_reads_stored_version() {
        let store = InMemoryJobStore::new();
        let registry = OperationRegistry::with_core_operations();
        let job = job_on(1, codes::EDIT_ENTRY);
        store.insert(job.clone()).await.unwrap();

        store
            .modify(job.id, &mut |record: &mut JobRecord| {
                record.status = JobStatus::Canceled
            })
            .await
            .unwrap();

        let done = JobUpdate::status(JobStatus::Done);
        let applied = apply_update(&store, &registry, job.id, &done)
            .await
            .unwrap()
            .unwrap();
        assert!(applied.effect.frozen);
        assert_eq!(applied.record.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_modify_through_trait_object_borrows_caller_state() {
        let store: std::sync::Arc<dyn JobStore> =
            std::sync::Arc::new(InMemoryJobStore::new());
        let job = job_on(1, codes::EDIT_ENTRY);
        store.insert(job.clone()).await.unwrap();

        let text = String::from("borrowed");
        let mut seen = Vec::new();
        let stored = store
            .modify(job.id, &mut |record: &mut JobRecord| {
                seen.push(record.status);
                record.text.clone_from(&text);
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.text, "borrowed");
        assert_eq!(seen, vec![JobStatus::Preparing]);
        let missing = store
            .modify(JobId::new(), &mut |_: &mut JobRecord| {})
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let store = InMemoryJobStore::new();
        let job = job_on(1, codes::EDIT_ENTRY);
        store.insert(job.clone()).await.unwrap();
        assert!(store.insert(job).await.is_err());
    }
}
