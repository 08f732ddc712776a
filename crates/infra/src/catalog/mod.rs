//! Read-only, paginated access to the product catalog.

mod in_memory;

pub use in_memory::InMemoryProductCatalog;

use async_trait::async_trait;

use forgebatch_catalog::{Product, ProductFilter};

/// Opaque position in a filtered product listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageCursor(pub String);

/// One page of products and the cursor of the next page, if any.
#[derive(Debug, Clone, Default)]
pub struct ProductPage {
    pub products: Vec<Product>,
    pub next_cursor: Option<PageCursor>,
}

/// Errors raised by a product source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// The backing store could not be reached; retrying may help.
    #[error("product source unavailable: {0}")]
    Unavailable(String),

    /// The source returned data that violates the catalog model.
    #[error("product source schema error: {0}")]
    Schema(String),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// Paginated, filterable product reads.
///
/// Pages are keyset-ordered and stable: walking `next_cursor` until it is
/// `None` visits every matching product exactly once.
#[async_trait]
pub trait ProductSource: Send + Sync {
    async fn fetch_page(
        &self,
        filter: &ProductFilter,
        cursor: Option<&PageCursor>,
        page_size: usize,
    ) -> Result<ProductPage, SourceError>;

    /// Number of matching products, when the source can tell cheaply.
    async fn count(&self, _filter: &ProductFilter) -> Result<Option<u64>, SourceError> {
        Ok(None)
    }
}
