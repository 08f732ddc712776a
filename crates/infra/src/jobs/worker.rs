//! Worker pool: N tokio tasks that receive deliveries and drive the
//! orchestrator.
//!
//! While a delivery runs, its visibility lease is renewed every half
//! timeout, so only a worker that actually stopped loses its job to a
//! redelivery. A delivery is acked once the orchestrator has recorded an
//! outcome (or the job no longer exists). On a store/queue error it is left
//! unacked, so the queue redelivers it after the visibility timeout.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

use super::orchestrator::{BatchJobOrchestrator, OrchestratorError, RunOutcome};
use super::queue::{Delivery, JobQueue};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// Long-poll wait per `receive`.
    pub poll_interval: Duration,
    /// Name prefix for logging.
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(250),
            name: "batch-worker".to_string(),
        }
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub deliveries: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub retried: u64,
    pub skipped: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Completed => self.completed += 1,
            RunOutcome::Failed => self.failed += 1,
            RunOutcome::Canceled => self.canceled += 1,
            RunOutcome::RetryScheduled { .. } => self.retried += 1,
            RunOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Handle to stop a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop receiving and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "batch worker task panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.workers` tasks on the current runtime.
    pub fn spawn(orchestrator: Arc<BatchJobOrchestrator>, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let queue = orchestrator.queue().clone();

        let joins = (0..config.workers.max(1))
            .map(|n| {
                let worker = format!("{}-{n}", config.name);
                let span = tracing::info_span!("batch_worker", worker = %worker);
                tokio::spawn(
                    worker_loop(
                        orchestrator.clone(),
                        queue.clone(),
                        config.poll_interval,
                        shutdown_rx.clone(),
                        stats.clone(),
                    )
                    .instrument(span),
                )
            })
            .collect();

        info!(workers = config.workers.max(1), "batch worker pool started");

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }
}

async fn worker_loop(
    orchestrator: Arc<BatchJobOrchestrator>,
    queue: Arc<dyn JobQueue>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let received = tokio::select! {
            _ = shutdown_rx.changed() => break,
            r = queue.receive(poll_interval) => r,
        };

        match received {
            Ok(Some(delivery)) => handle_delivery(&orchestrator, queue.as_ref(), delivery, &stats).await,
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "queue receive failed; backing off");
                bump(&stats, |s| s.errors += 1);
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
    debug!("batch worker stopped");
}

async fn handle_delivery(
    orchestrator: &BatchJobOrchestrator,
    queue: &dyn JobQueue,
    delivery: Delivery,
    stats: &Mutex<WorkerStats>,
) {
    bump(stats, |s| s.deliveries += 1);
    debug!(job_id = %delivery.job_id, delivery_count = delivery.delivery_count, "delivery received");

    let ack = match run_with_lease(orchestrator, queue, &delivery).await {
        Ok(outcome) => {
            bump(stats, |s| s.record(&outcome));
            true
        }
        Err(OrchestratorError::NotFound(id)) => {
            warn!(job_id = %id, "delivery for unknown job; dropping");
            true
        }
        Err(e) => {
            error!(job_id = %delivery.job_id, error = %e, "job run failed; leaving for redelivery");
            bump(stats, |s| s.errors += 1);
            false
        }
    };

    if ack {
        if let Err(e) = queue.ack(&delivery).await {
            warn!(job_id = %delivery.job_id, error = %e, "ack failed");
        }
    }
}

/// Drive one delivery, renewing its visibility lease until the run returns.
async fn run_with_lease(
    orchestrator: &BatchJobOrchestrator,
    queue: &dyn JobQueue,
    delivery: &Delivery,
) -> Result<RunOutcome, OrchestratorError> {
    let lease = queue.visibility_timeout();
    let every = (lease / 2).max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let run = orchestrator.dequeue_and_run(delivery.job_id);
    tokio::pin!(run);

    loop {
        tokio::select! {
            outcome = &mut run => return outcome,
            _ = heartbeat.tick() => {
                match queue.extend_visibility(delivery, lease).await {
                    Ok(()) => debug!(job_id = %delivery.job_id, "visibility lease renewed"),
                    Err(e) => warn!(job_id = %delivery.job_id, error = %e, "could not renew visibility lease"),
                }
            }
        }
    }
}

fn bump(stats: &Mutex<WorkerStats>, f: impl FnOnce(&mut WorkerStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::{json, Value as JsonValue};

    use forgebatch_batch::{BatchJob, BatchJobContext, BatchJobResult, BatchJobStatus, PRODUCT_EXPORT};
    use forgebatch_core::{DomainError, UserId};

    use crate::jobs::orchestrator::OrchestratorConfig;
    use crate::jobs::progress::JobProgress;
    use crate::jobs::queue::InMemoryJobQueue;
    use crate::jobs::registry::{BatchJobProcessor, ProcessorError, ProcessorRegistry};
    use crate::jobs::store::{InMemoryJobStore, JobStore};

    struct Immediate;

    #[async_trait]
    impl BatchJobProcessor for Immediate {
        fn job_type(&self) -> &'static str {
            PRODUCT_EXPORT
        }

        fn validate(&self, context: JsonValue) -> Result<BatchJobContext, DomainError> {
            BatchJobContext::from_parts(PRODUCT_EXPORT, context)
        }

        async fn run(&self, job: &BatchJob, _progress: &dyn JobProgress) -> Result<BatchJobResult, ProcessorError> {
            Ok(BatchJobResult {
                file_key: format!("{}.csv", job.id),
                file_size: 0,
                count: 0,
            })
        }
    }

    /// Pages through a slow source, reporting after every page.
    struct Paged {
        pages: u64,
        page_time: Duration,
        runs: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl BatchJobProcessor for Paged {
        fn job_type(&self) -> &'static str {
            PRODUCT_EXPORT
        }

        fn validate(&self, context: JsonValue) -> Result<BatchJobContext, DomainError> {
            BatchJobContext::from_parts(PRODUCT_EXPORT, context)
        }

        async fn run(&self, job: &BatchJob, progress: &dyn JobProgress) -> Result<BatchJobResult, ProcessorError> {
            self.runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            for page in 1..=self.pages {
                tokio::time::sleep(self.page_time).await;
                if progress.is_cancel_requested().await {
                    return Err(ProcessorError::Canceled);
                }
                progress.report(page, Some(self.pages)).await;
            }
            Ok(BatchJobResult {
                file_key: format!("{}-{}.csv", job.id, job.attempts),
                file_size: 0,
                count: self.pages,
            })
        }
    }

    #[tokio::test]
    async fn job_longer_than_visibility_timeout_completes_on_first_attempt() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(Duration::from_millis(200)));
        let processor = Arc::new(Paged {
            pages: 5,
            page_time: Duration::from_millis(100),
            runs: Default::default(),
        });
        let registry = ProcessorRegistry::new().with(processor.clone()).unwrap();
        let orchestrator = Arc::new(BatchJobOrchestrator::new(
            store.clone(),
            queue.clone(),
            Arc::new(registry),
            OrchestratorConfig::default(),
        ));

        let job = orchestrator
            .submit(PRODUCT_EXPORT, json!({}), UserId::new())
            .await
            .unwrap();

        let pool = WorkerPool::spawn(
            orchestrator.clone(),
            WorkerPoolConfig {
                workers: 2,
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        let done = loop {
            let current = store.get(job.id).await.unwrap().unwrap();
            if current.is_terminal() {
                break current;
            }
            assert!(Instant::now() < deadline, "job did not finish in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        pool.shutdown().await;

        assert_eq!(done.status, BatchJobStatus::Completed, "error: {:?}", done.error);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.progress.advancement_count, 5);
        assert_eq!(processor.runs.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn pool_drains_queue_and_shuts_down() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryJobQueue::default());
        let registry = ProcessorRegistry::new().with(Arc::new(Immediate)).unwrap();
        let orchestrator = Arc::new(BatchJobOrchestrator::new(
            store.clone(),
            queue.clone(),
            Arc::new(registry),
            OrchestratorConfig::default(),
        ));

        let mut ids = Vec::new();
        for _ in 0..5 {
            let job = orchestrator
                .submit(PRODUCT_EXPORT, json!({}), UserId::new())
                .await
                .unwrap();
            ids.push(job.id);
        }

        let pool = WorkerPool::spawn(
            orchestrator.clone(),
            WorkerPoolConfig {
                workers: 3,
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats().completed < 5 {
            assert!(Instant::now() < deadline, "jobs did not complete in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for id in &ids {
            let job = store.get(*id).await.unwrap().unwrap();
            assert_eq!(job.status, BatchJobStatus::Completed);
        }
        assert_eq!(pool.stats().deliveries, 5);
        pool.shutdown().await;

        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.in_flight_len(), 0);
    }
}
