//! Batch job domain model.
//!
//! Pure, deterministic state: the `BatchJob` record and its status machine,
//! the per-type context union, results, failure classification and the retry
//! policy. Storage, queues and execution live in `forgebatch-infra`.

pub mod context;
pub mod error;
pub mod job;
pub mod result;
pub mod retry;

pub use context::{
    BatchJobContext, ExportShape, ProductExportContext, MAX_IMAGE_COLUMNS, MAX_OPTION_COLUMNS, MAX_PRICE_COLUMNS,
    PRODUCT_EXPORT,
};
pub use error::{BatchJobError, FailureKind};
pub use job::{BatchJob, BatchJobProgress, BatchJobStatus, CancelOutcome};
pub use result::BatchJobResult;
pub use retry::{BackoffStrategy, RetryPolicy};
