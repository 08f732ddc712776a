//! Batch job execution.
//!
//! ## Components
//!
//! - `JobStore`: versioned persistence, single source of truth for status
//! - `JobQueue`: at-least-once delivery with delays and visibility timeout
//! - `ProcessorRegistry`: job type → `BatchJobProcessor`
//! - `BatchJobOrchestrator`: submit / run / status / cancel / list
//! - `WorkerPool`: tokio tasks draining the queue into the orchestrator
//!
//! Durable backends live behind the `postgres` and `redis` features.

pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod store;
pub mod worker;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_queue;

pub use orchestrator::{BatchJobOrchestrator, OrchestratorConfig, OrchestratorError, RunOutcome};
pub use progress::{JobProgress, StoreProgress};
pub use queue::{Delivery, InMemoryJobQueue, JobQueue, QueueError};
pub use registry::{BatchJobProcessor, ProcessorError, ProcessorRegistry, RegistryError};
pub use store::{InMemoryJobStore, JobQuery, JobStore, JobStoreError};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats};

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
