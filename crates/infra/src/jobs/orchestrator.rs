//! Batch job orchestrator: submission, execution state machine, status,
//! cancellation and listing.
//!
//! All state changes are read-modify-write cycles against the job store with
//! an optimistic version check (`mutate`). A write whose precondition no
//! longer holds (job became terminal, attempt superseded) turns into a no-op,
//! so two workers can never both commit a terminal state.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, instrument, warn};

use forgebatch_batch::{BatchJob, BatchJobError, BatchJobResult, BatchJobStatus, CancelOutcome, RetryPolicy};
use forgebatch_core::{BatchJobId, DomainError, ExpectedVersion, UserId};

use super::progress::StoreProgress;
use super::queue::{JobQueue, QueueError};
use super::registry::{BatchJobProcessor, ProcessorError, ProcessorRegistry};
use super::store::{JobQuery, JobStore, JobStoreError};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub retry_policy: RetryPolicy,
    /// Re-reads allowed when a write hits a version conflict.
    pub conflict_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            conflict_retries: 5,
        }
    }
}

/// What a single `dequeue_and_run` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Canceled,
    RetryScheduled { delay: Duration },
    /// Nothing to do: the job was terminal or another attempt owns it.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("invalid job context: {0}")]
    Validation(String),

    #[error("batch job not found: {0}")]
    NotFound(BatchJobId),

    #[error("batch job {0} kept conflicting; giving up")]
    Contention(BatchJobId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(JobStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<JobStoreError> for OrchestratorError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(id) => OrchestratorError::NotFound(id),
            other => OrchestratorError::Store(other),
        }
    }
}

pub struct BatchJobOrchestrator {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<ProcessorRegistry>,
    config: OrchestratorConfig,
}

impl BatchJobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<ProcessorRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Validate, persist and enqueue a new job.
    #[instrument(skip_all, fields(job_type = %job_type, actor = %actor))]
    pub async fn submit(
        &self,
        job_type: &str,
        context: JsonValue,
        actor: UserId,
    ) -> Result<BatchJob, OrchestratorError> {
        let processor = self
            .registry
            .resolve(job_type)
            .map_err(|_| OrchestratorError::UnknownJobType(job_type.to_string()))?;
        let ctx = processor
            .validate(context)
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;

        let job = self.store.insert(BatchJob::new(ctx, actor)).await?;

        if let Err(e) = self.queue.enqueue(job.id, Duration::ZERO).await {
            error!(job_id = %job.id, error = %e, "enqueue failed; marking job failed");
            let failure = BatchJobError::transient("enqueue_failed", e.to_string());
            let marked = self
                .mutate(job.id, |j| {
                    if j.is_terminal() {
                        return Ok(false);
                    }
                    j.fail(failure.clone())?;
                    Ok(true)
                })
                .await;
            if let Err(mark_err) = marked {
                error!(job_id = %job.id, error = %mark_err, "could not record enqueue failure");
            }
            return Err(e.into());
        }

        info!(job_id = %job.id, "batch job submitted");
        Ok(job)
    }

    /// Execute one delivery of `id`. Safe to call repeatedly for the same id.
    #[instrument(skip_all, fields(job_id = %id))]
    pub async fn dequeue_and_run(&self, id: BatchJobId) -> Result<RunOutcome, OrchestratorError> {
        let job = self.get_status(id).await?;

        if job.is_terminal() {
            debug!(status = job.status.as_str(), "job already terminal; skipping");
            return Ok(RunOutcome::Skipped);
        }

        if job.cancel_requested {
            let canceled = self
                .mutate(id, |j| {
                    if j.is_terminal() {
                        return Ok(false);
                    }
                    j.mark_canceled()?;
                    Ok(true)
                })
                .await?;
            return Ok(if canceled.is_some() {
                info!("batch job canceled before start");
                RunOutcome::Canceled
            } else {
                RunOutcome::Skipped
            });
        }

        if job.is_crash_redelivery() {
            warn!(attempt = job.attempts, "job redelivered while processing; previous worker presumed dead");
            if !self.config.retry_policy.should_retry(job.attempts) {
                let failure = BatchJobError::worker_crash(format!(
                    "worker stopped during attempt {} and no attempts are left",
                    job.attempts
                ));
                return self.finish_failed(id, job.attempts, failure).await;
            }
        }

        // A cancel that lands after the read above is finalized here; this
        // delivery is the last one the job gets.
        let seen = job.attempts;
        let started = self
            .mutate(id, |j| {
                if j.is_terminal() || j.attempts != seen {
                    return Ok(false);
                }
                if j.cancel_requested {
                    j.mark_canceled()?;
                } else {
                    j.start_processing()?;
                }
                Ok(true)
            })
            .await?;
        let Some(job) = started else {
            debug!("another delivery owns this job; skipping");
            return Ok(RunOutcome::Skipped);
        };
        if job.status == BatchJobStatus::Canceled {
            info!("batch job canceled before start");
            return Ok(RunOutcome::Canceled);
        }
        let attempt = job.attempts;

        let processor = match self.registry.resolve(job.job_type()) {
            Ok(p) => p,
            Err(e) => {
                let failure = BatchJobError::permanent("unknown_job_type", e.to_string());
                return self.finish_failed(id, attempt, failure).await;
            }
        };

        info!(attempt, job_type = job.job_type(), "processing batch job");
        let progress = StoreProgress::new(self.store.clone(), id, attempt);

        match processor.run(&job, &progress).await {
            Ok(result) => self.finish_completed(id, attempt, result, processor.as_ref()).await,
            Err(ProcessorError::Canceled) => self.finish_canceled(id, attempt).await,
            Err(ProcessorError::Permanent { code, message }) => {
                warn!(attempt, %code, %message, "permanent processing failure");
                self.finish_failed(id, attempt, BatchJobError::permanent(code, message))
                    .await
            }
            Err(ProcessorError::Transient { code, message }) => {
                self.retry_or_fail(id, attempt, code, message).await
            }
        }
    }

    /// Current state of a job.
    pub async fn get_status(&self, id: BatchJobId) -> Result<BatchJob, OrchestratorError> {
        self.store
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))
    }

    /// Best-effort cancellation; returns the job after the request.
    #[instrument(skip_all, fields(job_id = %id))]
    pub async fn cancel(&self, id: BatchJobId) -> Result<BatchJob, OrchestratorError> {
        let updated = self
            .mutate(id, |j| Ok(j.request_cancel() != CancelOutcome::AlreadyTerminal))
            .await?;
        match updated {
            Some(job) => {
                info!(status = job.status.as_str(), "cancel requested");
                Ok(job)
            }
            None => self.get_status(id).await,
        }
    }

    pub async fn list(&self, query: &JobQuery) -> Result<Vec<BatchJob>, OrchestratorError> {
        Ok(self.store.list(query).await?)
    }

    async fn finish_completed(
        &self,
        id: BatchJobId,
        attempt: u32,
        result: BatchJobResult,
        processor: &dyn BatchJobProcessor,
    ) -> Result<RunOutcome, OrchestratorError> {
        let written = self
            .mutate(id, |j| {
                if j.is_terminal() || j.attempts != attempt {
                    return Ok(false);
                }
                j.complete(result.clone())?;
                Ok(true)
            })
            .await?;

        if written.is_some() {
            info!(attempt, file_key = %result.file_key, count = result.count, "batch job completed");
            return Ok(RunOutcome::Completed);
        }

        warn!(attempt, file_key = %result.file_key, "completion lost a race; discarding artifact");
        if let Err(e) = processor.discard(&result).await {
            error!(file_key = %result.file_key, error = %e, "failed to discard orphaned artifact");
        }
        Ok(RunOutcome::Skipped)
    }

    async fn finish_failed(
        &self,
        id: BatchJobId,
        attempt: u32,
        failure: BatchJobError,
    ) -> Result<RunOutcome, OrchestratorError> {
        let written = self
            .mutate(id, |j| {
                if j.is_terminal() || j.attempts != attempt {
                    return Ok(false);
                }
                j.fail(failure.clone())?;
                Ok(true)
            })
            .await?;

        Ok(if written.is_some() {
            warn!(attempt, code = %failure.code, kind = failure.kind.as_str(), "batch job failed");
            RunOutcome::Failed
        } else {
            RunOutcome::Skipped
        })
    }

    async fn finish_canceled(&self, id: BatchJobId, attempt: u32) -> Result<RunOutcome, OrchestratorError> {
        let written = self
            .mutate(id, |j| {
                if j.is_terminal() || j.attempts != attempt {
                    return Ok(false);
                }
                j.mark_canceled()?;
                Ok(true)
            })
            .await?;

        Ok(if written.is_some() {
            info!(attempt, "batch job canceled");
            RunOutcome::Canceled
        } else {
            RunOutcome::Skipped
        })
    }

    async fn retry_or_fail(
        &self,
        id: BatchJobId,
        attempt: u32,
        code: String,
        message: String,
    ) -> Result<RunOutcome, OrchestratorError> {
        let policy = &self.config.retry_policy;
        if !policy.should_retry(attempt) {
            let failure = BatchJobError::transient(
                "retries_exhausted",
                format!("{code}: {message} (after {attempt} attempts)"),
            );
            return self.finish_failed(id, attempt, failure).await;
        }

        let delay = policy.delay_for_attempt(attempt);
        let last = BatchJobError::transient(code, message);
        let scheduled = self
            .mutate(id, |j| {
                if j.is_terminal() || j.attempts != attempt {
                    return Ok(false);
                }
                j.schedule_retry(last.clone())?;
                Ok(true)
            })
            .await?;
        if scheduled.is_none() {
            return Ok(RunOutcome::Skipped);
        }

        if let Err(e) = self.queue.enqueue(id, delay).await {
            error!(attempt, error = %e, "could not enqueue retry");
            let failure = BatchJobError::transient("enqueue_failed", e.to_string());
            return self.finish_failed(id, attempt, failure).await;
        }

        warn!(attempt, delay_ms = delay.as_millis() as u64, code = %last.code, "transient failure; retry scheduled");
        Ok(RunOutcome::RetryScheduled { delay })
    }

    /// Read-modify-write with bounded retry on version conflicts.
    ///
    /// `apply` returns `Ok(false)` to abandon the write. An invalid
    /// transition is treated the same way: the job moved on underneath us.
    async fn mutate<F>(&self, id: BatchJobId, mut apply: F) -> Result<Option<BatchJob>, OrchestratorError>
    where
        F: FnMut(&mut BatchJob) -> Result<bool, DomainError> + Send,
    {
        for _ in 0..=self.config.conflict_retries {
            let mut job = self.get_status(id).await?;
            let expected = ExpectedVersion::Exact(job.version);

            match apply(&mut job) {
                Ok(true) => {}
                Ok(false) => return Ok(None),
                Err(DomainError::InvalidTransition(reason)) => {
                    debug!(%reason, "transition no longer valid; skipping write");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }

            match self.store.update(job, expected).await {
                Ok(stored) => return Ok(Some(stored)),
                Err(JobStoreError::Conflict { .. }) => {
                    debug!("version conflict; re-reading job");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrchestratorError::Contention(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use forgebatch_batch::{BatchJobContext, BatchJobStatus, FailureKind, PRODUCT_EXPORT};

    use crate::jobs::progress::JobProgress;
    use crate::jobs::queue::{Delivery, InMemoryJobQueue};
    use crate::jobs::store::InMemoryJobStore;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Succeed,
        Transient,
        Permanent,
        /// Sets the cancel flag through the store, then polls it like a real processor.
        CancelMidway,
        /// Another actor fails the job before this attempt can complete.
        LoseRace,
    }

    struct Scripted {
        store: Arc<dyn JobStore>,
        script: Mutex<VecDeque<Step>>,
        runs: AtomicU32,
        discarded: AtomicU32,
    }

    impl Scripted {
        fn new(store: Arc<dyn JobStore>, steps: &[Step]) -> Arc<Self> {
            Arc::new(Self {
                store,
                script: Mutex::new(steps.iter().copied().collect()),
                runs: AtomicU32::new(0),
                discarded: AtomicU32::new(0),
            })
        }
    }

    fn result_for(job: &BatchJob) -> BatchJobResult {
        BatchJobResult {
            file_key: format!("exports/{}-{}.csv", job.id, job.attempts),
            file_size: 42,
            count: 1,
        }
    }

    #[async_trait]
    impl BatchJobProcessor for Scripted {
        fn job_type(&self) -> &'static str {
            PRODUCT_EXPORT
        }

        fn validate(&self, context: JsonValue) -> Result<BatchJobContext, DomainError> {
            BatchJobContext::from_parts(PRODUCT_EXPORT, context)
        }

        async fn run(&self, job: &BatchJob, progress: &dyn JobProgress) -> Result<BatchJobResult, ProcessorError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
            match step {
                Step::Succeed => Ok(result_for(job)),
                Step::Transient => Err(ProcessorError::transient("source_unavailable", "connection reset")),
                Step::Permanent => Err(ProcessorError::permanent("schema_mismatch", "too many options")),
                Step::CancelMidway => {
                    let mut stored = self.store.get(job.id).await.unwrap().unwrap();
                    stored.request_cancel();
                    let v = stored.version;
                    self.store.update(stored, ExpectedVersion::Exact(v)).await.unwrap();
                    if progress.is_cancel_requested().await {
                        Err(ProcessorError::Canceled)
                    } else {
                        Ok(result_for(job))
                    }
                }
                Step::LoseRace => {
                    let mut stored = self.store.get(job.id).await.unwrap().unwrap();
                    stored.fail(BatchJobError::permanent("other", "finished elsewhere")).unwrap();
                    self.store.update(stored, ExpectedVersion::Any).await.unwrap();
                    Ok(result_for(job))
                }
            }
        }

        async fn discard(&self, _result: &BatchJobResult) -> Result<(), ProcessorError> {
            self.discarded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        store: Arc<dyn JobStore>,
        queue: Arc<InMemoryJobQueue>,
        processor: Arc<Scripted>,
        orchestrator: BatchJobOrchestrator,
    }

    fn harness(steps: &[Step], max_attempts: u32) -> Harness {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryJobQueue::default());
        let processor = Scripted::new(store.clone(), steps);
        let registry = ProcessorRegistry::new().with(processor.clone()).unwrap();
        let orchestrator = BatchJobOrchestrator::new(
            store.clone(),
            queue.clone(),
            Arc::new(registry),
            OrchestratorConfig {
                retry_policy: RetryPolicy::fixed(max_attempts, Duration::ZERO),
                conflict_retries: 3,
            },
        );
        Harness {
            store,
            queue,
            processor,
            orchestrator,
        }
    }

    async fn submit(h: &Harness) -> BatchJob {
        h.orchestrator
            .submit(PRODUCT_EXPORT, json!({ "filterable_fields": { "title": "X" } }), UserId::new())
            .await
            .unwrap()
    }

    async fn next_delivery(h: &Harness) -> Delivery {
        h.queue.receive(Duration::ZERO).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn submit_persists_created_job_and_enqueues_it() {
        let h = harness(&[], 3);
        let job = submit(&h).await;

        let status = h.orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(status.status, BatchJobStatus::Created);
        assert_eq!(h.queue.pending_len(), 1);
        assert_eq!(next_delivery(&h).await.job_id, job.id);
    }

    #[tokio::test]
    async fn submit_rejects_unknown_type_and_bad_context() {
        let h = harness(&[], 3);
        let actor = UserId::new();

        let err = h.orchestrator.submit("order-import", json!({}), actor).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownJobType(_)));

        let err = h
            .orchestrator
            .submit(PRODUCT_EXPORT, json!({ "filterable_fields": { "colour": "red" } }), actor)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));

        assert!(h.orchestrator.list(&JobQuery::default()).await.unwrap().is_empty());
        assert_eq!(h.queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn successful_run_completes_and_redelivery_is_a_no_op() {
        let h = harness(&[Step::Succeed], 3);
        let job = submit(&h).await;

        let outcome = h.orchestrator.dequeue_and_run(job.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let done = h.orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(done.status, BatchJobStatus::Completed);
        assert_eq!(done.attempts, 1);
        assert!(done.result.is_some());

        assert_eq!(h.orchestrator.dequeue_and_run(job.id).await.unwrap(), RunOutcome::Skipped);
        assert_eq!(h.processor.runs.load(Ordering::SeqCst), 1);
        let again = h.orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(again.result, done.result);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_succeeds() {
        let h = harness(&[Step::Transient, Step::Succeed], 3);
        let job = submit(&h).await;
        let first = next_delivery(&h).await;

        let outcome = h.orchestrator.dequeue_and_run(first.job_id).await.unwrap();
        assert!(matches!(outcome, RunOutcome::RetryScheduled { .. }));

        let mid = h.orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(mid.status, BatchJobStatus::Processing);
        assert!(mid.retry_scheduled);
        assert!(mid.error.is_none());

        let retry = next_delivery(&h).await;
        assert_eq!(retry.job_id, job.id);
        assert_eq!(h.orchestrator.dequeue_and_run(retry.job_id).await.unwrap(), RunOutcome::Completed);

        let done = h.orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(done.attempts, 2);
        assert!(done.last_error.is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_last_classification() {
        let h = harness(&[Step::Transient, Step::Transient], 2);
        let job = submit(&h).await;

        h.orchestrator.dequeue_and_run(job.id).await.unwrap();
        let outcome = h.orchestrator.dequeue_and_run(job.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed);

        let failed = h.orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(failed.status, BatchJobStatus::Failed);
        let error = failed.error.unwrap();
        assert_eq!(error.kind, FailureKind::Transient);
        assert_eq!(error.code, "retries_exhausted");
        assert!(error.message.contains("source_unavailable"));
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let h = harness(&[Step::Permanent], 5);
        let job = submit(&h).await;
        next_delivery(&h).await;

        assert_eq!(h.orchestrator.dequeue_and_run(job.id).await.unwrap(), RunOutcome::Failed);
        let failed = h.orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.error.unwrap().kind, FailureKind::Permanent);
        assert_eq!(h.queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn cancel_created_job_is_immediate() {
        let h = harness(&[], 3);
        let job = submit(&h).await;

        let canceled = h.orchestrator.cancel(job.id).await.unwrap();
        assert_eq!(canceled.status, BatchJobStatus::Canceled);

        assert_eq!(h.orchestrator.dequeue_and_run(job.id).await.unwrap(), RunOutcome::Skipped);
        assert_eq!(h.processor.runs.load(Ordering::SeqCst), 0);

        // cancel of a terminal job leaves it unchanged
        let again = h.orchestrator.cancel(job.id).await.unwrap();
        assert_eq!(again.version, canceled.version);
    }

    #[tokio::test]
    async fn running_job_observes_cancellation() {
        let h = harness(&[Step::CancelMidway], 3);
        let job = submit(&h).await;

        assert_eq!(h.orchestrator.dequeue_and_run(job.id).await.unwrap(), RunOutcome::Canceled);
        let canceled = h.orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(canceled.status, BatchJobStatus::Canceled);
        assert!(canceled.result.is_none() && canceled.error.is_none());
    }

    #[tokio::test]
    async fn cancel_flag_on_processing_job_is_honored_at_dequeue() {
        let h = harness(&[], 3);
        let job = submit(&h).await;

        let mut stored = h.store.get(job.id).await.unwrap().unwrap();
        stored.start_processing().unwrap();
        let v = stored.version;
        h.store.update(stored, ExpectedVersion::Exact(v)).await.unwrap();

        let flagged = h.orchestrator.cancel(job.id).await.unwrap();
        assert_eq!(flagged.status, BatchJobStatus::Processing);
        assert!(flagged.cancel_requested);

        assert_eq!(h.orchestrator.dequeue_and_run(job.id).await.unwrap(), RunOutcome::Canceled);
        assert_eq!(h.processor.runs.load(Ordering::SeqCst), 0);
    }

    /// Requests cancellation of a job right after it was read `after_reads` times.
    struct CancelAfterRead {
        inner: InMemoryJobStore,
        reads: AtomicU32,
        after_reads: u32,
    }

    #[async_trait]
    impl JobStore for CancelAfterRead {
        async fn insert(&self, job: BatchJob) -> Result<BatchJob, JobStoreError> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: BatchJobId) -> Result<Option<BatchJob>, JobStoreError> {
            let found = self.inner.get(id).await?;
            if self.reads.fetch_add(1, Ordering::SeqCst) + 1 == self.after_reads {
                if let Some(mut job) = found.clone() {
                    let v = job.version;
                    job.request_cancel();
                    self.inner.update(job, ExpectedVersion::Exact(v)).await?;
                }
            }
            Ok(found)
        }

        async fn update(&self, job: BatchJob, expected: ExpectedVersion) -> Result<BatchJob, JobStoreError> {
            self.inner.update(job, expected).await
        }

        async fn list(&self, query: &JobQuery) -> Result<Vec<BatchJob>, JobStoreError> {
            self.inner.list(query).await
        }
    }

    #[tokio::test]
    async fn cancel_landing_between_load_and_start_finalizes_the_job() {
        let inner = InMemoryJobStore::new();
        let job = inner
            .insert(BatchJob::new(BatchJobContext::from_parts(PRODUCT_EXPORT, json!({})).unwrap(), UserId::new()))
            .await
            .unwrap();

        // a retry is queued for a job already in processing
        let mut stored = inner.get(job.id).await.unwrap().unwrap();
        stored.start_processing().unwrap();
        stored
            .schedule_retry(BatchJobError::transient("source_unavailable", "connection reset"))
            .unwrap();
        let v = stored.version;
        inner.update(stored, ExpectedVersion::Exact(v)).await.unwrap();

        // read 1 is the status check in dequeue_and_run; the cancel lands right after it
        let store: Arc<dyn JobStore> = Arc::new(CancelAfterRead {
            inner,
            reads: AtomicU32::new(0),
            after_reads: 1,
        });
        let processor = Scripted::new(store.clone(), &[Step::Succeed]);
        let registry = ProcessorRegistry::new().with(processor.clone()).unwrap();
        let orchestrator = BatchJobOrchestrator::new(
            store.clone(),
            Arc::new(InMemoryJobQueue::default()),
            Arc::new(registry),
            OrchestratorConfig::default(),
        );

        assert_eq!(orchestrator.dequeue_and_run(job.id).await.unwrap(), RunOutcome::Canceled);

        let canceled = orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(canceled.status, BatchJobStatus::Canceled);
        assert!(canceled.cancel_requested);
        assert_eq!(canceled.attempts, 1);
        assert_eq!(processor.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn crash_redelivery_retries_then_fails_when_exhausted() {
        let h = harness(&[Step::Succeed], 2);
        let job = submit(&h).await;

        // simulate a worker that started the job and died
        let mut stored = h.store.get(job.id).await.unwrap().unwrap();
        stored.start_processing().unwrap();
        let v = stored.version;
        h.store.update(stored, ExpectedVersion::Exact(v)).await.unwrap();

        assert_eq!(h.orchestrator.dequeue_and_run(job.id).await.unwrap(), RunOutcome::Completed);
        assert_eq!(h.orchestrator.get_status(job.id).await.unwrap().attempts, 2);

        let h = harness(&[], 1);
        let job = submit(&h).await;
        let mut stored = h.store.get(job.id).await.unwrap().unwrap();
        stored.start_processing().unwrap();
        let v = stored.version;
        h.store.update(stored, ExpectedVersion::Exact(v)).await.unwrap();

        assert_eq!(h.orchestrator.dequeue_and_run(job.id).await.unwrap(), RunOutcome::Failed);
        let failed = h.orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(failed.error.unwrap().kind, FailureKind::WorkerCrash);
        assert_eq!(h.processor.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn losing_completion_race_discards_artifact() {
        let h = harness(&[Step::LoseRace], 3);
        let job = submit(&h).await;

        assert_eq!(h.orchestrator.dequeue_and_run(job.id).await.unwrap(), RunOutcome::Skipped);
        assert_eq!(h.processor.discarded.load(Ordering::SeqCst), 1);

        let stored = h.orchestrator.get_status(job.id).await.unwrap();
        assert_eq!(stored.status, BatchJobStatus::Failed);
        assert!(stored.result.is_none());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let h = harness(&[], 3);
        let id = BatchJobId::new();
        assert!(matches!(h.orchestrator.get_status(id).await, Err(OrchestratorError::NotFound(_))));
        assert!(matches!(h.orchestrator.cancel(id).await, Err(OrchestratorError::NotFound(_))));
        assert!(matches!(
            h.orchestrator.dequeue_and_run(id).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    struct BrokenQueue;

    #[async_trait]
    impl JobQueue for BrokenQueue {
        async fn enqueue(&self, _job_id: BatchJobId, _delay: Duration) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("redis down".into()))
        }

        async fn receive(&self, _wait: Duration) -> Result<Option<Delivery>, QueueError> {
            Ok(None)
        }

        async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
            Ok(())
        }

        async fn extend_visibility(&self, _delivery: &Delivery, _extension: Duration) -> Result<(), QueueError> {
            Ok(())
        }

        fn visibility_timeout(&self) -> Duration {
            Duration::from_secs(30)
        }
    }

    #[tokio::test]
    async fn enqueue_failure_marks_job_failed() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let registry = ProcessorRegistry::new()
            .with(Scripted::new(store.clone(), &[]))
            .unwrap();
        let orchestrator = BatchJobOrchestrator::new(
            store.clone(),
            Arc::new(BrokenQueue),
            Arc::new(registry),
            OrchestratorConfig::default(),
        );

        let err = orchestrator
            .submit(PRODUCT_EXPORT, json!({}), UserId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Queue(_)));

        let jobs = orchestrator.list(&JobQuery::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, BatchJobStatus::Failed);
        assert_eq!(jobs[0].error.as_ref().unwrap().code, "enqueue_failed");
    }
}
