//! Per-type job parameters.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use forgebatch_catalog::ProductFilter;
use forgebatch_core::{DomainError, DomainResult};

/// Job type key of the product export.
pub const PRODUCT_EXPORT: &str = "product-export";

pub const MAX_OPTION_COLUMNS: usize = 20;
pub const MAX_IMAGE_COLUMNS: usize = 50;
pub const MAX_PRICE_COLUMNS: usize = 50;
const MAX_BATCH_SIZE: usize = 1_000;

/// Job context, keyed by job type.
///
/// Serialized adjacently tagged (`{"type": ..., "context": {...}}`) so a job
/// record reads the same way it was submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "context")]
pub enum BatchJobContext {
    #[serde(rename = "product-export")]
    ProductExport(ProductExportContext),
}

impl BatchJobContext {
    pub fn job_type(&self) -> &'static str {
        match self {
            BatchJobContext::ProductExport(_) => PRODUCT_EXPORT,
        }
    }

    /// Parse and validate a raw submission for a job type.
    ///
    /// Unknown types are reported as a validation error here; the processor
    /// registry is responsible for the "unknown job type" classification.
    pub fn from_parts(job_type: &str, context: JsonValue) -> DomainResult<Self> {
        match job_type {
            PRODUCT_EXPORT => {
                // `null` / missing context means "export everything".
                let context = if context.is_null() {
                    JsonValue::Object(Default::default())
                } else {
                    context
                };
                let ctx: ProductExportContext = serde_json::from_value(context)
                    .map_err(|e| DomainError::validation(format!("invalid {PRODUCT_EXPORT} context: {e}")))?;
                ctx.validate()?;
                Ok(BatchJobContext::ProductExport(ctx))
            }
            other => Err(DomainError::validation(format!("no context schema for job type '{other}'"))),
        }
    }

    /// The inner context as submitted (without the type tag).
    pub fn to_json(&self) -> JsonValue {
        match self {
            BatchJobContext::ProductExport(ctx) => {
                serde_json::to_value(ctx).unwrap_or(JsonValue::Null)
            }
        }
    }
}

/// Shape of the dynamic column groups of a product export.
///
/// Declared up front so the column layout never depends on the data. A
/// product with more options or images than declared fails the whole export
/// with `schema_mismatch`, so size these for the widest product in the
/// filtered set (defaults: 3 option columns, 3 image columns).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportShape {
    /// Number of `Option {i} Name` / `Option {i} Value` column pairs, up to
    /// `MAX_OPTION_COLUMNS`.
    #[serde(default = "default_option_columns")]
    pub option_columns: usize,

    /// One `Price {CODE}` column per currency, in this order.
    #[serde(default)]
    pub price_currencies: Vec<String>,

    /// Number of `Image {i} Url` columns, up to `MAX_IMAGE_COLUMNS`.
    #[serde(default = "default_image_columns")]
    pub image_columns: usize,
}

fn default_option_columns() -> usize {
    3
}

fn default_image_columns() -> usize {
    3
}

impl Default for ExportShape {
    fn default() -> Self {
        Self {
            option_columns: default_option_columns(),
            price_currencies: Vec::new(),
            image_columns: default_image_columns(),
        }
    }
}

impl ExportShape {
    pub fn validate(&self) -> DomainResult<()> {
        if self.option_columns > MAX_OPTION_COLUMNS {
            return Err(DomainError::validation(format!(
                "option_columns must be at most {MAX_OPTION_COLUMNS}"
            )));
        }
        if self.image_columns > MAX_IMAGE_COLUMNS {
            return Err(DomainError::validation(format!(
                "image_columns must be at most {MAX_IMAGE_COLUMNS}"
            )));
        }
        if self.price_currencies.len() > MAX_PRICE_COLUMNS {
            return Err(DomainError::validation(format!(
                "price_currencies must list at most {MAX_PRICE_COLUMNS} codes"
            )));
        }

        let mut seen: Vec<String> = Vec::with_capacity(self.price_currencies.len());
        for code in &self.price_currencies {
            if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(DomainError::validation(format!(
                    "'{code}' is not a three-letter currency code"
                )));
            }
            let normalized = code.to_ascii_lowercase();
            if seen.contains(&normalized) {
                return Err(DomainError::validation(format!(
                    "currency '{code}' listed twice"
                )));
            }
            seen.push(normalized);
        }

        Ok(())
    }
}

/// Parameters of a `product-export` job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProductExportContext {
    /// Product selection; `filter` is accepted as an alias.
    #[serde(default, alias = "filter")]
    pub filterable_fields: ProductFilter,

    #[serde(default)]
    pub shape: ExportShape,

    /// Page size override for this export.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Requested column schema version; only version 1 exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
}

impl ProductExportContext {
    pub fn validate(&self) -> DomainResult<()> {
        self.filterable_fields.validate()?;
        self.shape.validate()?;

        if let Some(size) = self.batch_size {
            if size == 0 || size > MAX_BATCH_SIZE {
                return Err(DomainError::validation(format!(
                    "batch_size must be between 1 and {MAX_BATCH_SIZE}"
                )));
            }
        }

        if let Some(version) = self.schema_version {
            if version != 1 {
                return Err(DomainError::validation(format!(
                    "unsupported schema_version {version}"
                )));
            }
        }

        Ok(())
    }
}
