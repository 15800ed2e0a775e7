use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::job::{
    JobId, JobParams, JobRecord, JobStatus, ObjectRef, OperationCode, OwnerId,
    TargetKey, TargetKind, TargetRef,
};
use crate::store::JobStore;

const SELECT_COLUMNS: &str = r#"
    id, owner_id, target_kind, target_id, target_name, target_active,
    operation, status, text, params, dependent_job, created_at, updated_at
"#;

/// PostgreSQL-backed job store.
///
/// Records live in a single `jobchain_jobs` table. [`JobStore::modify`] runs
/// as `SELECT ... FOR UPDATE` followed by an `UPDATE` in one transaction, so
/// concurrent status changes serialize on the row lock.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the table and its indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobchain_jobs (
                id UUID PRIMARY KEY,
                owner_id BIGINT NOT NULL,
                target_kind TEXT NOT NULL,
                target_id BIGINT NULL,
                target_name TEXT NULL,
                target_active BOOLEAN NULL,
                operation INTEGER NOT NULL,
                status SMALLINT NOT NULL,
                text TEXT NOT NULL DEFAULT '',
                params TEXT NOT NULL DEFAULT '{}',
                dependent_job UUID NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS jobchain_jobs_target_idx
                ON jobchain_jobs
                   (target_kind, target_id, operation, created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS jobchain_jobs_owner_idx
                ON jobchain_jobs (owner_id, created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn status_to_i16(status: JobStatus) -> i16 {
        i16::from(status.code())
    }

    fn i16_to_status(value: i16) -> anyhow::Result<JobStatus> {
        u8::try_from(value)
            .ok()
            .and_then(JobStatus::from_code)
            .ok_or_else(|| anyhow::anyhow!("invalid status value: {}", value))
    }

    fn operation_to_i32(operation: OperationCode) -> anyhow::Result<i32> {
        i32::try_from(operation.get())
            .map_err(|_| {
                anyhow::anyhow!("operation code {operation} out of range")
            })
    }

    fn row_to_record(row: &PgRow) -> anyhow::Result<JobRecord> {
        let target_kind: String = row.try_get("target_kind")?;
        let target_kind = TargetKind::from_str_lossy(&target_kind);
        let target_id: Option<i64> = row.try_get("target_id")?;
        let target = match target_id {
            Some(id) => {
                let name: Option<String> = row.try_get("target_name")?;
                let is_active: Option<bool> = row.try_get("target_active")?;
                Some(TargetRef::from_parts(
                    target_kind,
                    ObjectRef {
                        id,
                        name: name.unwrap_or_default(),
                        is_active: is_active.unwrap_or(true),
                    },
                ))
            }
            None => None,
        };

        let operation: i32 = row.try_get("operation")?;
        let operation = u32::try_from(operation)
            .map_err(|_| {
                anyhow::anyhow!("invalid operation value: {operation}")
            })?;
        let dependent_job: Option<Uuid> = row.try_get("dependent_job")?;
        let params: String = row.try_get("params")?;

        Ok(JobRecord {
            id: JobId(row.try_get("id")?),
            owner: OwnerId(row.try_get("owner_id")?),
            target,
            target_kind,
            operation: OperationCode::new(operation),
            status: Self::i16_to_status(row.try_get("status")?)?,
            text: row.try_get("text")?,
            params: JobParams::from_json_str(&params),
            dependent_job: dependent_job.map(JobId),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn write_back(
        tx: &mut Transaction<'_, Postgres>,
        record: &JobRecord,
    ) -> anyhow::Result<()> {
        let object = record.target.as_ref().map(TargetRef::object);
        sqlx::query(
            r#"
            UPDATE jobchain_jobs
            SET target_kind = $2,
                target_id = $3,
                target_name = $4,
                target_active = $5,
                operation = $6,
                status = $7,
                text = $8,
                dependent_job = $9,
                updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(record.id.0)
        .bind(record.target_kind.as_str())
        .bind(object.map(|o| o.id))
        .bind(object.map(|o| o.name.clone()))
        .bind(object.map(|o| o.is_active))
        .bind(Self::operation_to_i32(record.operation)?)
        .bind(Self::status_to_i16(record.status))
        .bind(&record.text)
        .bind(record.dependent_job.map(|id| id.0))
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn non_terminal_codes() -> Vec<i16> {
        JobStatus::ALL
            .into_iter()
            .filter(|status| !status.is_terminal())
            .map(Self::status_to_i16)
            .collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, record: JobRecord) -> anyhow::Result<()> {
        let object = record.target.as_ref().map(TargetRef::object);
        sqlx::query(
            r#"
            INSERT INTO jobchain_jobs (
                id, owner_id, target_kind, target_id, target_name,
                target_active, operation, status, text, params,
                dependent_job, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id.0)
        .bind(record.owner.0)
        .bind(record.target_kind.as_str())
        .bind(object.map(|o| o.id))
        .bind(object.map(|o| o.name.clone()))
        .bind(object.map(|o| o.is_active))
        .bind(Self::operation_to_i32(record.operation)?)
        .bind(Self::status_to_i16(record.status))
        .bind(&record.text)
        .bind(record.params.as_str())
        .bind(record.dependent_job.map(|id| id.0))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(
            job_id = %record.id,
            operation = %record.operation,
            "inserted job record"
        );
        Ok(())
    }

    async fn fetch(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM jobchain_jobs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn modify(
        &self,
        id: JobId,
        mutate: &mut (dyn for<'r> FnMut(&'r mut JobRecord) + Send),
    ) -> anyhow::Result<Option<JobRecord>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM jobchain_jobs \
             WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut record = Self::row_to_record(&row)?;
        let before = record.clone();
        mutate(&mut record);
        if record != before {
            Self::write_back(&mut tx, &record).await?;
        }

        tx.commit().await?;
        Ok(Some(record))
    }

    async fn latest_active(
        &self,
        target: TargetKey,
        operation: OperationCode,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM jobchain_jobs
            WHERE target_kind = $1
              AND target_id = $2
              AND operation = $3
              AND status = ANY($4)
              AND updated_at >= $5
            ORDER BY created_at DESC, updated_at DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(target.kind.as_str())
        .bind(target.id)
        .bind(Self::operation_to_i32(operation)?)
        .bind(Self::non_terminal_codes())
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn find_by_owner_params(
        &self,
        owner: OwnerId,
        params: &JobParams,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM jobchain_jobs
            WHERE owner_id = $1 AND params = $2
            ORDER BY created_at DESC, updated_at DESC, id DESC
            "#
        ))
        .bind(owner.0)
        .bind(params.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn list_by_owner(
        &self,
        owner: OwnerId,
        limit: usize,
        exclude_operations: &[OperationCode],
    ) -> anyhow::Result<Vec<JobRecord>> {
        let excluded = exclude_operations
            .iter()
            .map(|code| Self::operation_to_i32(*code))
            .collect::<anyhow::Result<Vec<i32>>>()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM jobchain_jobs
            WHERE owner_id = $1
              AND NOT (operation = ANY($2))
            ORDER BY created_at DESC, updated_at DESC, id DESC
            LIMIT $3
            "#
        ))
        .bind(owner.0)
        .bind(excluded)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn detach_target(&self, target: TargetKey) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobchain_jobs
            SET target_id = NULL,
                target_name = NULL,
                target_active = NULL
            WHERE target_kind = $1 AND target_id = $2
            "#,
        )
        .bind(target.kind.as_str())
        .bind(target.id)
        .execute(&self.pool)
        .await?;

        let touched = result.rows_affected();
        debug!(%target, touched, "detached target from jobs");
        Ok(touched)
    }
}
