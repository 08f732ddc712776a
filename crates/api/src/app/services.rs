//! Service wiring: job store, queue, processors, orchestrator and workers.
//!
//! In-memory store and queue by default. With the `postgres` feature and
//! `DATABASE_URL` set, jobs are stored in Postgres; with the `redis` feature
//! and `REDIS_URL` set, the queue lives in Redis.

use std::sync::Arc;

use tracing::info;

use forgebatch_infra::catalog::ProductSource;
use forgebatch_infra::export::ProductExportProcessor;
use forgebatch_infra::jobs::{
    BatchJobOrchestrator, InMemoryJobQueue, InMemoryJobStore, JobQueue, JobStore, JobStoreError, QueueError,
    ProcessorRegistry, RegistryError, WorkerPool, WorkerPoolHandle,
};
use forgebatch_infra::storage::{FileStorage, LocalFileStorage};
use forgebatch_infra::BatchConfig;

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("database connection failed: {0}")]
    Database(String),
}

/// Everything the handlers need.
#[derive(Clone)]
pub struct AppServices {
    pub orchestrator: Arc<BatchJobOrchestrator>,
    pub storage: Arc<dyn FileStorage>,
}

impl AppServices {
    /// Wire services over the given store and queue.
    pub fn new(
        config: &BatchConfig,
        catalog: Arc<dyn ProductSource>,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Result<Self, ServicesError> {
        let storage: Arc<dyn FileStorage> = Arc::new(LocalFileStorage::new(config.upload_dir.clone()));
        let export = ProductExportProcessor::new(catalog, storage.clone(), config.export_writer());
        let registry = ProcessorRegistry::new().with(Arc::new(export))?;

        let orchestrator = Arc::new(BatchJobOrchestrator::new(
            store,
            queue,
            Arc::new(registry),
            config.orchestrator(),
        ));

        Ok(Self { orchestrator, storage })
    }

    /// In-memory store and queue.
    pub fn in_memory(config: &BatchConfig, catalog: Arc<dyn ProductSource>) -> Result<Self, ServicesError> {
        Self::new(
            config,
            catalog,
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryJobQueue::new(config.visibility_timeout)),
        )
    }

    pub fn spawn_workers(&self, config: &BatchConfig) -> WorkerPoolHandle {
        WorkerPool::spawn(self.orchestrator.clone(), config.worker_pool())
    }
}

/// Wire services from the environment (see module docs).
pub async fn build_services(
    config: &BatchConfig,
    catalog: Arc<dyn ProductSource>,
) -> Result<AppServices, ServicesError> {
    let store = job_store().await?;
    let queue = job_queue(config).await?;
    AppServices::new(config, catalog, store, queue)
}

#[cfg(feature = "postgres")]
async fn job_store() -> Result<Arc<dyn JobStore>, ServicesError> {
    use forgebatch_infra::jobs::PostgresJobStore;

    let Ok(url) = std::env::var("DATABASE_URL") else {
        info!("DATABASE_URL not set; using in-memory job store");
        return Ok(Arc::new(InMemoryJobStore::new()));
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .map_err(|e| ServicesError::Database(e.to_string()))?;
    let store = PostgresJobStore::new(pool);
    store.migrate().await?;
    info!("using postgres job store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn job_store() -> Result<Arc<dyn JobStore>, ServicesError> {
    info!("using in-memory job store");
    Ok(Arc::new(InMemoryJobStore::new()))
}

#[cfg(feature = "redis")]
async fn job_queue(config: &BatchConfig) -> Result<Arc<dyn JobQueue>, ServicesError> {
    use forgebatch_infra::jobs::RedisJobQueue;

    let Ok(url) = std::env::var("REDIS_URL") else {
        info!("REDIS_URL not set; using in-memory job queue");
        return Ok(Arc::new(InMemoryJobQueue::new(config.visibility_timeout)));
    };

    let queue = RedisJobQueue::connect(&url, config.visibility_timeout).await?;
    info!("using redis job queue");
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "redis"))]
async fn job_queue(config: &BatchConfig) -> Result<Arc<dyn JobQueue>, ServicesError> {
    info!("using in-memory job queue");
    Ok(Arc::new(InMemoryJobQueue::new(config.visibility_timeout)))
}
