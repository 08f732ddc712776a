use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;

use forgebatch_batch::{BatchJob, BatchJobContext, BatchJobResult, PRODUCT_EXPORT};
use forgebatch_core::DomainError;

use crate::catalog::{ProductSource, SourceError};
use crate::jobs::progress::JobProgress;
use crate::jobs::registry::{BatchJobProcessor, ProcessorError};
use crate::storage::{FileStorage, StorageError};

use super::serializer::SerializeError;
use super::writer::{ExportError, ExportWriter, ExportWriterConfig};

/// `product-export` job processor.
pub struct ProductExportProcessor {
    writer: ExportWriter,
}

impl ProductExportProcessor {
    pub fn new(
        source: Arc<dyn ProductSource>,
        storage: Arc<dyn FileStorage>,
        config: ExportWriterConfig,
    ) -> Self {
        Self {
            writer: ExportWriter::new(source, storage, config),
        }
    }

    /// Every attempt writes to a fresh key.
    fn file_key(job: &BatchJob) -> String {
        format!(
            "exports/products/product-export-{}-{}-{}.csv",
            Utc::now().timestamp_millis(),
            job.id,
            job.attempts
        )
    }
}

impl From<ExportError> for ProcessorError {
    fn from(e: ExportError) -> Self {
        match e {
            ExportError::Canceled => ProcessorError::Canceled,
            ExportError::Source(SourceError::Unavailable(m)) => ProcessorError::transient("source_unavailable", m),
            ExportError::Source(SourceError::Schema(m)) => ProcessorError::permanent("schema_mismatch", m),
            ExportError::Source(SourceError::InvalidCursor(m)) => ProcessorError::permanent("invalid_cursor", m),
            ExportError::Serialize(SerializeError::SchemaMismatch(m)) => {
                ProcessorError::permanent("schema_mismatch", m)
            }
            ExportError::Serialize(SerializeError::Encode(m)) => ProcessorError::permanent("encode_failed", m),
            ExportError::Storage(StorageError::InvalidKey(k)) => {
                ProcessorError::permanent("invalid_storage_key", k)
            }
            ExportError::Storage(other) => ProcessorError::transient("storage_error", other.to_string()),
        }
    }
}

#[async_trait]
impl BatchJobProcessor for ProductExportProcessor {
    fn job_type(&self) -> &'static str {
        PRODUCT_EXPORT
    }

    fn validate(&self, context: JsonValue) -> Result<BatchJobContext, DomainError> {
        BatchJobContext::from_parts(PRODUCT_EXPORT, context)
    }

    async fn run(&self, job: &BatchJob, progress: &dyn JobProgress) -> Result<BatchJobResult, ProcessorError> {
        let BatchJobContext::ProductExport(ctx) = &job.context;
        let file_key = Self::file_key(job);

        let summary = self.writer.write(&file_key, ctx, progress).await?;

        Ok(BatchJobResult {
            file_key,
            file_size: summary.file_size,
            count: summary.rows,
        })
    }

    async fn discard(&self, result: &BatchJobResult) -> Result<(), ProcessorError> {
        self.writer
            .storage()
            .delete(&result.file_key)
            .await
            .map_err(|e| ProcessorError::transient("storage_error", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use forgebatch_catalog::{Product, ProductVariant};
    use forgebatch_core::UserId;

    use crate::catalog::InMemoryProductCatalog;
    use crate::storage::LocalFileStorage;

    struct Quiet;

    #[async_trait]
    impl JobProgress for Quiet {
        async fn report(&self, _advancement_count: u64, _total_count: Option<u64>) {}

        async fn is_cancel_requested(&self) -> bool {
            false
        }
    }

    fn export_product() -> Product {
        let (p, size) = Product::new("Test export product").with_option("size");
        let (p, color) = p.with_option("color");
        p.with_description("test-product-description").with_variant(
            ProductVariant::new("Test variant")
                .with_sku("test-variant-sku-product-export")
                .with_inventory_quantity(10)
                .with_price("usd", 100)
                .with_price("eur", 45)
                .with_price("dkk", 30)
                .with_option_value(size, "large")
                .with_option_value(color, "green"),
        )
    }

    #[tokio::test]
    async fn exports_filtered_product_with_positional_columns() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = InMemoryProductCatalog::new();
        let product = export_product();
        catalog.insert(product.clone()).unwrap();
        catalog.insert(Product::new("Something else")).unwrap();

        let storage = Arc::new(LocalFileStorage::new(dir.path()));
        let processor =
            ProductExportProcessor::new(Arc::new(catalog), storage.clone(), ExportWriterConfig::default());

        let ctx = processor
            .validate(json!({ "filterable_fields": { "title": "Test export product" } }))
            .unwrap();
        let mut job = BatchJob::new(ctx, UserId::new());
        job.start_processing().unwrap();

        let result = processor.run(&job, &Quiet).await.unwrap();
        assert_eq!(result.count, 1);
        assert!(result.file_key.starts_with("exports/products/product-export-"));
        assert!(result.file_key.ends_with(&format!("{}-1.csv", job.id)));

        let path = storage.resolve(&result.file_key).await.unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(result.file_size, text.len() as u64);

        let lines: Vec<&str> = text.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2);

        let cols: Vec<&str> = lines[1].split(';').collect();
        let variant = &product.variants[0];
        assert_eq!(cols[0], product.id.to_string());
        assert_eq!(cols[2], "Test export product");
        assert_eq!(cols[4], "test-product-description");
        assert_eq!(cols[23], variant.id.to_string());
        assert_eq!(cols[24], "Test variant");
        assert_eq!(cols[25], "test-variant-sku-product-export");
    }

    #[tokio::test]
    async fn discard_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalFileStorage::new(dir.path()));
        let processor = ProductExportProcessor::new(
            Arc::new(InMemoryProductCatalog::new()),
            storage.clone(),
            ExportWriterConfig::default(),
        );

        let mut job = BatchJob::new(processor.validate(JsonValue::Null).unwrap(), UserId::new());
        job.start_processing().unwrap();
        let result = processor.run(&job, &Quiet).await.unwrap();
        assert_eq!(result.count, 0);
        assert!(storage.exists(&result.file_key).await.unwrap());

        processor.discard(&result).await.unwrap();
        assert!(!storage.exists(&result.file_key).await.unwrap());
    }

    #[test]
    fn export_errors_are_classified() {
        let transient: ProcessorError = ExportError::Source(SourceError::Unavailable("down".into())).into();
        assert!(matches!(transient, ProcessorError::Transient { .. }));

        let permanent: ProcessorError =
            ExportError::Serialize(SerializeError::SchemaMismatch("too many images".into())).into();
        assert!(matches!(permanent, ProcessorError::Permanent { ref code, .. } if code == "schema_mismatch"));

        let canceled: ProcessorError = ExportError::Canceled.into();
        assert_eq!(canceled, ProcessorError::Canceled);
    }
}
