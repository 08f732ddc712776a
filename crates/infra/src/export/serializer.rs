//! Product → delimited rows.
//!
//! One row per variant with the product columns repeated; a product without
//! variants still yields a single row. Encoding is RFC 4180 quoting with `;`
//! as delimiter and CRLF line endings.

use csv::{QuoteStyle, Terminator, WriterBuilder};

use forgebatch_batch::{ExportShape, MAX_IMAGE_COLUMNS, MAX_OPTION_COLUMNS};
use forgebatch_catalog::{Product, ProductVariant};

use super::schema::ColumnLayout;

pub const DELIMITER: u8 = b';';

#[derive(Debug, Clone, thiserror::Error)]
pub enum SerializeError {
    /// The product does not fit the declared column layout.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("encoding failed: {0}")]
    Encode(String),
}

/// Serializes products against a fixed column layout.
#[derive(Debug, Clone)]
pub struct RowSerializer {
    layout: ColumnLayout,
}

impl RowSerializer {
    pub fn new(shape: &ExportShape) -> Self {
        Self {
            layout: ColumnLayout::new(shape),
        }
    }

    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    /// Encoded header line.
    pub fn encode_header(&self) -> Result<Vec<u8>, SerializeError> {
        encode_records(std::iter::once(self.layout.header()))
    }

    /// Encode every row of a page; returns the bytes and the row count.
    pub fn encode_page(&self, products: &[Product]) -> Result<(Vec<u8>, u64), SerializeError> {
        let mut rows = Vec::new();
        for product in products {
            rows.extend(self.rows(product)?);
        }
        let count = rows.len() as u64;
        Ok((encode_records(rows)?, count))
    }

    /// Unencoded rows for one product.
    pub fn rows(&self, product: &Product) -> Result<Vec<Vec<String>>, SerializeError> {
        self.check_fits(product)?;

        if product.variants.is_empty() {
            return Ok(vec![self.row(product, None)?]);
        }
        product
            .variants
            .iter()
            .map(|v| self.row(product, Some(v)))
            .collect()
    }

    fn check_fits(&self, product: &Product) -> Result<(), SerializeError> {
        if product.options.len() > self.layout.option_columns() {
            return Err(SerializeError::SchemaMismatch(format!(
                "product {} has {} options but shape.option_columns is {}; \
                 raise it (at most {MAX_OPTION_COLUMNS}) to export this product",
                product.id,
                product.options.len(),
                self.layout.option_columns()
            )));
        }
        if product.images.len() > self.layout.image_columns() {
            return Err(SerializeError::SchemaMismatch(format!(
                "product {} has {} images but shape.image_columns is {}; \
                 raise it (at most {MAX_IMAGE_COLUMNS}) to export this product",
                product.id,
                product.images.len(),
                self.layout.image_columns()
            )));
        }
        Ok(())
    }

    fn row(&self, product: &Product, variant: Option<&ProductVariant>) -> Result<Vec<String>, SerializeError> {
        let mut row: Vec<String> = Vec::with_capacity(self.layout.width());

        row.push(product.id.to_string());
        row.push(product.handle.clone());
        row.push(product.title.clone());
        row.push(opt(&product.subtitle));
        row.push(opt(&product.description));
        row.push(product.status.as_str().to_string());
        row.push(opt(&product.thumbnail));
        row.push(num(product.weight));
        row.push(num(product.length));
        row.push(num(product.width));
        row.push(num(product.height));
        row.push(opt(&product.hs_code));
        row.push(opt(&product.origin_country));
        row.push(opt(&product.mid_code));
        row.push(opt(&product.material));
        row.push(product.collection.as_ref().map(|c| c.title.clone()).unwrap_or_default());
        row.push(product.collection.as_ref().map(|c| c.handle.clone()).unwrap_or_default());
        row.push(product.product_type.as_ref().map(|t| t.value.clone()).unwrap_or_default());
        row.push(
            product
                .tags
                .iter()
                .map(|t| t.value.as_str())
                .collect::<Vec<_>>()
                .join(","),
        );
        row.push(product.discountable.to_string());
        row.push(opt(&product.external_id));
        row.push(product.profile.as_ref().map(|p| p.name.clone()).unwrap_or_default());
        row.push(
            product
                .profile
                .as_ref()
                .map(|p| p.profile_type.as_str().to_string())
                .unwrap_or_default(),
        );

        match variant {
            Some(v) => {
                row.push(v.id.to_string());
                row.push(v.title.clone());
                row.push(opt(&v.sku));
                row.push(opt(&v.barcode));
                row.push(v.inventory_quantity.to_string());
                row.push(v.allow_backorder.to_string());
                row.push(v.manage_inventory.to_string());
                row.push(num(v.weight));
                row.push(num(v.length));
                row.push(num(v.width));
                row.push(num(v.height));
                row.push(opt(&v.hs_code));
                row.push(opt(&v.origin_country));
                row.push(opt(&v.mid_code));
                row.push(opt(&v.material));
            }
            None => row.extend(std::iter::repeat_n(String::new(), 15)),
        }

        if let Some(v) = variant {
            if let Some(orphan) = v.options.iter().find(|ov| product.option(ov.option_id).is_none()) {
                return Err(SerializeError::SchemaMismatch(format!(
                    "variant {} has a value for option {} which product {} does not declare",
                    v.id, orphan.option_id.0, product.id
                )));
            }
        }

        for slot in 0..self.layout.option_columns() {
            match product.options.get(slot) {
                Some(option) => {
                    row.push(option.title.clone());
                    row.push(
                        variant
                            .and_then(|v| v.options.iter().find(|ov| ov.option_id == option.id))
                            .map(|ov| ov.value.clone())
                            .unwrap_or_default(),
                    );
                }
                None => {
                    row.push(String::new());
                    row.push(String::new());
                }
            }
        }

        for code in self.layout.currencies() {
            row.push(
                variant
                    .and_then(|v| v.price_for(code))
                    .map(|amount| amount.to_string())
                    .unwrap_or_default(),
            );
        }

        for slot in 0..self.layout.image_columns() {
            row.push(product.images.get(slot).map(|i| i.url.clone()).unwrap_or_default());
        }

        debug_assert_eq!(row.len(), self.layout.width());
        Ok(row)
    }
}

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn num(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn encode_records<I>(records: I) -> Result<Vec<u8>, SerializeError>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut writer = WriterBuilder::new()
        .delimiter(DELIMITER)
        .terminator(Terminator::CRLF)
        .quote_style(QuoteStyle::Necessary)
        .flexible(false)
        .from_writer(Vec::new());

    for record in records {
        writer
            .write_record(&record)
            .map_err(|e| SerializeError::Encode(e.to_string()))?;
    }

    writer
        .into_inner()
        .map_err(|e| SerializeError::Encode(e.to_string()))
}
