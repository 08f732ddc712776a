//! Streaming export writer.
//!
//! Pulls products page by page from a `ProductSource`, serializes each page
//! and appends it to a storage sink. Memory stays proportional to one page.
//! On any failure the sink is aborted, so a failed export never leaves a
//! resolvable artifact.

use std::sync::Arc;

use tracing::{debug, info, warn};

use forgebatch_batch::ProductExportContext;

use crate::catalog::{PageCursor, ProductSource, SourceError};
use crate::jobs::progress::JobProgress;
use crate::storage::{ExportSink, FileStorage, StorageError};

use super::serializer::{RowSerializer, SerializeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportWriterConfig {
    /// Products fetched per page.
    pub page_size: usize,
    /// Minimum number of products between two progress reports.
    pub progress_interval: u64,
}

impl Default for ExportWriterConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            progress_interval: 100,
        }
    }
}

/// What a finished export produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    /// Data rows written (excluding the header).
    pub rows: u64,
    /// Products read from the source.
    pub products: u64,
    pub file_size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error("export canceled")]
    Canceled,
}

pub struct ExportWriter {
    source: Arc<dyn ProductSource>,
    storage: Arc<dyn FileStorage>,
    config: ExportWriterConfig,
}

impl ExportWriter {
    pub fn new(
        source: Arc<dyn ProductSource>,
        storage: Arc<dyn FileStorage>,
        config: ExportWriterConfig,
    ) -> Self {
        Self {
            source,
            storage,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<dyn FileStorage> {
        &self.storage
    }

    /// Write the export for `ctx` under `key`.
    pub async fn write(
        &self,
        key: &str,
        ctx: &ProductExportContext,
        progress: &dyn JobProgress,
    ) -> Result<ExportSummary, ExportError> {
        let serializer = RowSerializer::new(&ctx.shape);
        let page_size = ctx.batch_size.unwrap_or(self.config.page_size).max(1);
        let total = self.source.count(&ctx.filterable_fields).await?;

        let mut sink = self.storage.open_for_write(key).await?;
        let streamed = self
            .stream(sink.as_mut(), &serializer, ctx, page_size, total, progress)
            .await;

        match streamed {
            Ok((rows, products)) => {
                let file_size = sink.commit().await?;
                info!(key, rows, products, file_size, "export committed");
                Ok(ExportSummary {
                    rows,
                    products,
                    file_size,
                })
            }
            Err(e) => {
                if let Err(abort_err) = sink.abort().await {
                    warn!(key, error = %abort_err, "failed to abort export sink");
                }
                debug!(key, error = %e, "export aborted");
                Err(e)
            }
        }
    }

    async fn stream(
        &self,
        sink: &mut dyn ExportSink,
        serializer: &RowSerializer,
        ctx: &ProductExportContext,
        page_size: usize,
        total: Option<u64>,
        progress: &dyn JobProgress,
    ) -> Result<(u64, u64), ExportError> {
        sink.write(&serializer.encode_header()?).await?;

        let mut cursor: Option<PageCursor> = None;
        let mut rows = 0u64;
        let mut products = 0u64;
        let mut since_report = 0u64;
        let mut page_no = 0u64;

        loop {
            if progress.is_cancel_requested().await {
                info!(page = page_no, products, "export canceled at page boundary");
                return Err(ExportError::Canceled);
            }

            let page = self
                .source
                .fetch_page(&ctx.filterable_fields, cursor.as_ref(), page_size)
                .await?;
            page_no += 1;

            let (bytes, page_rows) = serializer.encode_page(&page.products)?;
            if !bytes.is_empty() {
                sink.write(&bytes).await?;
            }

            rows += page_rows;
            products += page.products.len() as u64;
            since_report += page.products.len() as u64;
            debug!(page = page_no, page_rows, products, "export page written");

            if since_report >= self.config.progress_interval.max(1) {
                progress.report(products, total).await;
                since_report = 0;
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        progress.report(products, total.or(Some(products))).await;
        Ok((rows, products))
    }
}
