//! The narrow handle a running processor gets to its own job.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use forgebatch_batch::BatchJobStatus;
use forgebatch_core::{BatchJobId, ExpectedVersion};

use super::store::{JobStore, JobStoreError};

const PROGRESS_WRITE_ATTEMPTS: u32 = 3;

/// Progress reporting and cancellation polling for one attempt.
///
/// Both calls are advisory: failures are logged, never surfaced to the
/// processor.
#[async_trait]
pub trait JobProgress: Send + Sync {
    async fn report(&self, advancement_count: u64, total_count: Option<u64>);

    /// True when the job was canceled, or when this attempt was superseded
    /// and should stop early.
    async fn is_cancel_requested(&self) -> bool;
}

/// `JobProgress` backed by the job store, scoped to a single attempt.
pub struct StoreProgress {
    store: Arc<dyn JobStore>,
    job_id: BatchJobId,
    attempt: u32,
}

impl StoreProgress {
    pub fn new(store: Arc<dyn JobStore>, job_id: BatchJobId, attempt: u32) -> Self {
        Self {
            store,
            job_id,
            attempt,
        }
    }

    async fn try_report(&self, advancement_count: u64, total_count: Option<u64>) -> Result<(), JobStoreError> {
        for _ in 0..PROGRESS_WRITE_ATTEMPTS {
            let Some(mut job) = self.store.get(self.job_id).await? else {
                return Err(JobStoreError::NotFound(self.job_id));
            };
            if job.status != BatchJobStatus::Processing || job.attempts != self.attempt {
                return Ok(());
            }
            if job.record_progress(advancement_count, total_count).is_err() {
                return Ok(());
            }

            let expected = ExpectedVersion::Exact(job.version);
            match self.store.update(job, expected).await {
                Ok(_) => return Ok(()),
                Err(JobStoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        debug!(job_id = %self.job_id, "progress write kept conflicting; skipped");
        Ok(())
    }
}

#[async_trait]
impl JobProgress for StoreProgress {
    async fn report(&self, advancement_count: u64, total_count: Option<u64>) {
        if let Err(e) = self.try_report(advancement_count, total_count).await {
            warn!(job_id = %self.job_id, error = %e, "failed to record progress");
        }
    }

    async fn is_cancel_requested(&self) -> bool {
        match self.store.get(self.job_id).await {
            Ok(Some(job)) => job.cancel_requested || job.is_terminal() || job.attempts != self.attempt,
            Ok(None) => true,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "failed to poll cancellation flag");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgebatch_batch::{BatchJob, BatchJobContext, ProductExportContext};
    use forgebatch_core::UserId;

    use crate::jobs::store::InMemoryJobStore;

    async fn processing_job(store: &Arc<dyn JobStore>) -> BatchJob {
        let job = BatchJob::new(
            BatchJobContext::ProductExport(ProductExportContext::default()),
            UserId::new(),
        );
        let mut job = store.insert(job).await.unwrap();
        job.start_processing().unwrap();
        let v = job.version;
        store.update(job, ExpectedVersion::Exact(v)).await.unwrap()
    }

    #[tokio::test]
    async fn report_writes_progress_for_current_attempt() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job = processing_job(&store).await;

        let progress = StoreProgress::new(store.clone(), job.id, job.attempts);
        progress.report(10, Some(40)).await;

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress.advancement_count, 10);
        assert_eq!(stored.progress.total_count, Some(40));
        assert!(!progress.is_cancel_requested().await);
    }

    #[tokio::test]
    async fn superseded_attempt_is_ignored_and_told_to_stop() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job = processing_job(&store).await;

        let stale = StoreProgress::new(store.clone(), job.id, job.attempts + 1);
        stale.report(99, None).await;

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress.advancement_count, 0);
        assert!(stale.is_cancel_requested().await);
    }

    #[tokio::test]
    async fn cancel_flag_is_visible() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let mut job = processing_job(&store).await;
        job.request_cancel();
        let v = job.version;
        let job = store.update(job, ExpectedVersion::Exact(v)).await.unwrap();

        let progress = StoreProgress::new(store, job.id, job.attempts);
        assert!(progress.is_cancel_requested().await);
    }
}
