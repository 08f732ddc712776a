//! Product export: column schema, row serializer, streaming writer and the
//! `product-export` processor.

pub mod processor;
pub mod schema;
pub mod serializer;
pub mod writer;

pub use processor::ProductExportProcessor;
pub use schema::{ColumnLayout, PRODUCT_EXPORT_SCHEMA_VERSION};
pub use serializer::{RowSerializer, SerializeError};
pub use writer::{ExportError, ExportSummary, ExportWriter, ExportWriterConfig};
