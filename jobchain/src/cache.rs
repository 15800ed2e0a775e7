//! File-backed result blobs, one per job, for export-style operations.

use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::CacheError;
use crate::job::JobId;

/// Blob store keyed by job id under a single directory.
///
/// Files are named `job_<id>`. Writes land in a temporary sibling first and
/// are renamed into place, so a reader sees either the previous blob or the
/// complete new one.
#[derive(Clone, Debug)]
pub struct ResultCache {
    dir: PathBuf,
}

impl ResultCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("job_{job_id}"))
    }

    pub async fn set(
        &self,
        job_id: JobId,
        bytes: &[u8],
    ) -> Result<(), CacheError> {
        let io_err = |source: io::Error| CacheError::Io { job_id, source };

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let staging =
            self.dir.join(format!(".job_{job_id}.{}.tmp", Uuid::now_v7()));
        tokio::fs::write(&staging, bytes).await.map_err(io_err)?;
        let target = self.path_for(job_id);
        if let Err(err) = tokio::fs::rename(&staging, target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(io_err(err));
        }
        tracing::debug!(%job_id, bytes = bytes.len(), "result cached");
        Ok(())
    }

    /// Reads a cached blob. A job that never produced output is
    /// [`CacheError::NotFound`], distinct from I/O failures.
    pub async fn get(&self, job_id: JobId) -> Result<Vec<u8>, CacheError> {
        match tokio::fs::read(self.path_for(job_id)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(CacheError::NotFound { job_id })
            }
            Err(source) => Err(CacheError::Io { job_id, source }),
        }
    }

    pub async fn contains(&self, job_id: JobId) -> bool {
        tokio::fs::try_exists(self.path_for(job_id))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path().join("nested/cache"));
        let id = JobId::new();
        let payload = b"name,ip\nvm-01,10.0.0.1\n\x00\xff".to_vec();

        cache.set(id, &payload).await.unwrap();

        assert_eq!(cache.get(id).await.unwrap(), payload);
        assert!(cache.path_for(id).ends_with(format!("job_{id}")));
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        let id = JobId::new();

        let err = cache.get(id).await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound { job_id } if job_id == id));
        assert!(!cache.contains(id).await);
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        let id = JobId::new();

        cache.set(id, b"first").await.unwrap();
        cache.set(id, b"second").await.unwrap();

        assert_eq!(cache.get(id).await.unwrap(), b"second");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
