//! Product export column schema.
//!
//! Version 1 layout: 38 fixed columns, then the dynamic groups declared by
//! the job's `ExportShape` (option slots, price currencies, image slots).
//! Columns are never inferred from the data being exported.

use forgebatch_batch::ExportShape;

pub const PRODUCT_EXPORT_SCHEMA_VERSION: u32 = 1;

pub const FIXED_COLUMNS: [&str; 38] = [
    "Product ID",
    "Product Handle",
    "Product Title",
    "Product Subtitle",
    "Product Description",
    "Product Status",
    "Product Thumbnail",
    "Product Weight",
    "Product Length",
    "Product Width",
    "Product Height",
    "Product HS Code",
    "Product Origin Country",
    "Product MID Code",
    "Product Material",
    "Product Collection Title",
    "Product Collection Handle",
    "Product Type",
    "Product Tags",
    "Product Discountable",
    "Product External ID",
    "Product Profile Name",
    "Product Profile Type",
    "Variant ID",
    "Variant Title",
    "Variant SKU",
    "Variant Barcode",
    "Variant Inventory Quantity",
    "Variant Allow backorder",
    "Variant Manage inventory",
    "Variant Weight",
    "Variant Length",
    "Variant Width",
    "Variant Height",
    "Variant HS Code",
    "Variant Origin Country",
    "Variant MID Code",
    "Variant Material",
];

/// Index of the first variant column.
pub const VARIANT_COLUMNS_START: usize = 23;

/// Concrete column layout for one export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    option_columns: usize,
    /// Upper-cased, in declaration order.
    currencies: Vec<String>,
    image_columns: usize,
}

impl ColumnLayout {
    pub fn new(shape: &ExportShape) -> Self {
        Self {
            option_columns: shape.option_columns,
            currencies: shape
                .price_currencies
                .iter()
                .map(|c| c.to_ascii_uppercase())
                .collect(),
            image_columns: shape.image_columns,
        }
    }

    pub fn option_columns(&self) -> usize {
        self.option_columns
    }

    pub fn currencies(&self) -> &[String] {
        &self.currencies
    }

    pub fn image_columns(&self) -> usize {
        self.image_columns
    }

    /// Total number of columns in every row.
    pub fn width(&self) -> usize {
        FIXED_COLUMNS.len() + self.option_columns * 2 + self.currencies.len() + self.image_columns
    }

    pub fn header(&self) -> Vec<String> {
        let mut header: Vec<String> = Vec::with_capacity(self.width());
        header.extend(FIXED_COLUMNS.iter().map(|c| c.to_string()));
        for i in 1..=self.option_columns {
            header.push(format!("Option {i} Name"));
            header.push(format!("Option {i} Value"));
        }
        for code in &self.currencies {
            header.push(format!("Price {code}"));
        }
        for i in 1..=self.image_columns {
            header.push(format!("Image {i} Url"));
        }
        header
    }
}
