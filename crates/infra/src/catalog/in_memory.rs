use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use async_trait::async_trait;

use forgebatch_catalog::{Product, ProductFilter};
use forgebatch_core::{DomainError, ProductId};

use super::{PageCursor, ProductPage, ProductSource, SourceError};

/// In-memory catalog for tests/dev.
///
/// Products are ordered by id (UUIDv7, so creation order); the cursor is the
/// id of the last product of the previous page.
#[derive(Debug, Default)]
pub struct InMemoryProductCatalog {
    products: RwLock<BTreeMap<ProductId, Product>>,
}

impl InMemoryProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a product after checking its invariants.
    pub fn insert(&self, product: Product) -> Result<(), DomainError> {
        product.check_invariants()?;
        let mut products = self
            .products
            .write()
            .map_err(|_| DomainError::invariant("catalog lock poisoned"))?;
        products.insert(product.id, product);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.products.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProductSource for InMemoryProductCatalog {
    async fn fetch_page(
        &self,
        filter: &ProductFilter,
        cursor: Option<&PageCursor>,
        page_size: usize,
    ) -> Result<ProductPage, SourceError> {
        let start = match cursor {
            Some(c) => {
                let id: ProductId = c
                    .0
                    .parse()
                    .map_err(|e: DomainError| SourceError::InvalidCursor(e.to_string()))?;
                Bound::Excluded(id)
            }
            None => Bound::Unbounded,
        };

        let products = self
            .products
            .read()
            .map_err(|_| SourceError::Unavailable("catalog lock poisoned".to_string()))?;

        // One extra to learn whether another page exists.
        let mut page: Vec<Product> = products
            .range((start, Bound::Unbounded))
            .map(|(_, p)| p)
            .filter(|p| filter.matches(p))
            .take(page_size.max(1) + 1)
            .cloned()
            .collect();

        let next_cursor = if page.len() > page_size.max(1) {
            page.truncate(page_size.max(1));
            page.last().map(|p| PageCursor(p.id.to_string()))
        } else {
            None
        };

        Ok(ProductPage {
            products: page,
            next_cursor,
        })
    }

    async fn count(&self, filter: &ProductFilter) -> Result<Option<u64>, SourceError> {
        let products = self
            .products
            .read()
            .map_err(|_| SourceError::Unavailable("catalog lock poisoned".to_string()))?;
        Ok(Some(products.values().filter(|p| filter.matches(p)).count() as u64))
    }
}
