//! Job storage.
//!
//! The store is the single source of truth for job state. Every mutation is
//! an `update` guarded by the caller's expected version; the store bumps the
//! version on each successful write.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::instrument;

use forgebatch_batch::{BatchJob, BatchJobStatus};
use forgebatch_core::{BatchJobId, ExpectedVersion, UserId};

/// Listing criteria; results are newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQuery {
    pub created_by: Option<UserId>,
    pub job_type: Option<String>,
    pub status: Option<Vec<BatchJobStatus>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            created_by: None,
            job_type: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl JobQuery {
    pub fn matches(&self, job: &BatchJob) -> bool {
        self.created_by.is_none_or(|u| job.created_by == u)
            && self.job_type.as_deref().is_none_or(|t| job.job_type() == t)
            && self.status.as_ref().is_none_or(|s| s.contains(&job.status))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("batch job not found: {0}")]
    NotFound(BatchJobId),

    #[error("batch job already exists: {0}")]
    AlreadyExists(BatchJobId),

    /// Optimistic concurrency check failed.
    #[error("version conflict on batch job {id}: expected {expected:?}, found {actual}")]
    Conflict {
        id: BatchJobId,
        expected: ExpectedVersion,
        actual: u64,
    },

    /// The write would break a record invariant (immutable field, terminal regression).
    #[error("rejected write to batch job {0}: {1}")]
    Rejected(BatchJobId, String),

    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job at version 1.
    async fn insert(&self, job: BatchJob) -> Result<BatchJob, JobStoreError>;

    async fn get(&self, id: BatchJobId) -> Result<Option<BatchJob>, JobStoreError>;

    /// Replace a job if its stored version matches `expected`; returns the
    /// job as stored (with its new version).
    async fn update(&self, job: BatchJob, expected: ExpectedVersion) -> Result<BatchJob, JobStoreError>;

    async fn list(&self, query: &JobQuery) -> Result<Vec<BatchJob>, JobStoreError>;
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn insert(&self, job: BatchJob) -> Result<BatchJob, JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, id: BatchJobId) -> Result<Option<BatchJob>, JobStoreError> {
        (**self).get(id).await
    }

    async fn update(&self, job: BatchJob, expected: ExpectedVersion) -> Result<BatchJob, JobStoreError> {
        (**self).update(job, expected).await
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<BatchJob>, JobStoreError> {
        (**self).list(query).await
    }
}

/// Checks shared by every store implementation before an update is applied.
pub(crate) fn check_update(stored: &BatchJob, next: &BatchJob) -> Result<(), JobStoreError> {
    if stored.context != next.context
        || stored.created_by != next.created_by
        || stored.created_at != next.created_at
    {
        return Err(JobStoreError::Rejected(
            next.id,
            "context, creator and creation time are immutable".to_string(),
        ));
    }
    if stored.is_terminal() && stored.status != next.status {
        return Err(JobStoreError::Rejected(
            next.id,
            format!("status {} is terminal", stored.status.as_str()),
        ));
    }
    next.check_invariants()
        .map_err(|e| JobStoreError::Rejected(next.id, e.to_string()))
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<BatchJobId, BatchJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn insert(&self, mut job: BatchJob) -> Result<BatchJob, JobStoreError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        job.version = 1;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: BatchJobId) -> Result<Option<BatchJob>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;
        Ok(jobs.get(&id).cloned())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = job.status.as_str()))]
    async fn update(&self, mut job: BatchJob, expected: ExpectedVersion) -> Result<BatchJob, JobStoreError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;
        let stored = jobs.get(&job.id).ok_or(JobStoreError::NotFound(job.id))?;

        if !expected.matches(stored.version) {
            return Err(JobStoreError::Conflict {
                id: job.id,
                expected,
                actual: stored.version,
            });
        }
        check_update(stored, &job)?;

        job.version = stored.version + 1;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<BatchJob>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;
        let mut result: Vec<_> = jobs.values().filter(|j| query.matches(j)).cloned().collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(result.into_iter().skip(query.offset).take(query.limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgebatch_batch::{BatchJobContext, BatchJobError, ProductExportContext};

    fn job(user: UserId) -> BatchJob {
        BatchJob::new(
            BatchJobContext::ProductExport(ProductExportContext::default()),
            user,
        )
    }

    #[tokio::test]
    async fn insert_assigns_version_and_rejects_duplicates() {
        let store = InMemoryJobStore::new();
        let j = job(UserId::new());

        let stored = store.insert(j.clone()).await.unwrap();
        assert_eq!(stored.version, 1);
        assert!(matches!(
            store.insert(j).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn update_checks_expected_version() {
        let store = InMemoryJobStore::new();
        let mut j = store.insert(job(UserId::new())).await.unwrap();

        j.start_processing().unwrap();
        let v = j.version;
        let updated = store.update(j.clone(), ExpectedVersion::Exact(v)).await.unwrap();
        assert_eq!(updated.version, 2);

        // stale writer loses
        let err = store.update(j, ExpectedVersion::Exact(v)).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict { actual: 2, .. }));
    }

    #[tokio::test]
    async fn terminal_status_cannot_regress() {
        let store = InMemoryJobStore::new();
        let mut j = store.insert(job(UserId::new())).await.unwrap();
        j.fail(BatchJobError::permanent("x", "y")).unwrap();
        let failed = store.update(j, ExpectedVersion::Any).await.unwrap();

        let mut regressed = failed.clone();
        regressed.status = BatchJobStatus::Processing;
        regressed.error = None;
        assert!(matches!(
            store.update(regressed, ExpectedVersion::Any).await,
            Err(JobStoreError::Rejected(..))
        ));
    }

    #[tokio::test]
    async fn update_of_unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let err = store.update(job(UserId::new()), ExpectedVersion::Any).await.unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_filters_and_pages_newest_first() {
        let store = InMemoryJobStore::new();
        let alice = UserId::new();
        let bob = UserId::new();

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(store.insert(job(alice)).await.unwrap().id);
        }
        store.insert(job(bob)).await.unwrap();

        let query = JobQuery {
            created_by: Some(alice),
            ..Default::default()
        };
        let listed = store.list(&query).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        let page = store
            .list(&JobQuery {
                limit: 1,
                offset: 1,
                ..query.clone()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, listed[1].id);

        let none = store
            .list(&JobQuery {
                status: Some(vec![BatchJobStatus::Completed]),
                ..query
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
