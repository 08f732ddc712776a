//! Filterable fields for selecting products.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgebatch_core::{DomainError, DomainResult, ProductId};

use crate::product::{Product, ProductStatus};

/// Product selection criteria.
///
/// All set fields must match (logical AND). List-valued fields match when the
/// product matches any element. Unknown fields are rejected on deserialize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProductFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Vec<ProductId>>,

    /// Case-insensitive free-text search over title, subtitle, description and handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,

    /// Exact title match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Vec<ProductStatus>>,

    /// Collection handles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<Vec<String>>,

    /// Product type values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_type: Option<Vec<String>>,

    /// Tag values; a product matches if it carries any of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discountable: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
}

impl ProductFilter {
    pub fn by_title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Reject filters that can never be evaluated sensibly.
    pub fn validate(&self) -> DomainResult<()> {
        let empty_list = [
            ("id", self.id.as_ref().map(Vec::is_empty)),
            ("status", self.status.as_ref().map(Vec::is_empty)),
            ("collection", self.collection.as_ref().map(Vec::is_empty)),
            ("product_type", self.product_type.as_ref().map(Vec::is_empty)),
            ("tags", self.tags.as_ref().map(Vec::is_empty)),
        ];
        if let Some((field, _)) = empty_list.iter().find(|(_, e)| *e == Some(true)) {
            return Err(DomainError::validation(format!(
                "filter field '{field}' must not be an empty list"
            )));
        }

        if let (Some(after), Some(before)) = (self.created_after, self.created_before) {
            if after >= before {
                return Err(DomainError::validation(
                    "created_after must be earlier than created_before",
                ));
            }
        }

        Ok(())
    }

    /// Evaluate the filter against a product.
    pub fn matches(&self, product: &Product) -> bool {
        if let Some(ids) = &self.id {
            if !ids.contains(&product.id) {
                return false;
            }
        }

        if let Some(q) = &self.q {
            let needle = q.to_lowercase();
            let haystacks = [
                Some(product.title.as_str()),
                product.subtitle.as_deref(),
                product.description.as_deref(),
                Some(product.handle.as_str()),
            ];
            let hit = haystacks
                .iter()
                .flatten()
                .any(|h| h.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }

        if let Some(title) = &self.title {
            if &product.title != title {
                return false;
            }
        }

        if let Some(handle) = &self.handle {
            if &product.handle != handle {
                return false;
            }
        }

        if let Some(statuses) = &self.status {
            if !statuses.contains(&product.status) {
                return false;
            }
        }

        if let Some(collections) = &self.collection {
            match &product.collection {
                Some(c) if collections.contains(&c.handle) => {}
                _ => return false,
            }
        }

        if let Some(types) = &self.product_type {
            match &product.product_type {
                Some(t) if types.contains(&t.value) => {}
                _ => return false,
            }
        }

        if let Some(tags) = &self.tags {
            if !product.tags.iter().any(|t| tags.contains(&t.value)) {
                return false;
            }
        }

        if let Some(discountable) = self.discountable {
            if product.discountable != discountable {
                return false;
            }
        }

        if let Some(after) = self.created_after {
            if product.created_at <= after {
                return false;
            }
        }

        if let Some(before) = self.created_before {
            if product.created_at >= before {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn empty_filter_matches_everything() {
        assert!(ProductFilter::default().matches(&Product::new("Anything")));
    }

    #[test]
    fn title_is_exact_and_q_is_fuzzy() {
        let p = Product::new("Test export product").with_description("test-product-description");

        assert!(ProductFilter::by_title("Test export product").matches(&p));
        assert!(!ProductFilter::by_title("Test export").matches(&p));

        let q = ProductFilter {
            q: Some("PRODUCT-DESC".to_string()),
            ..Default::default()
        };
        assert!(q.matches(&p));
    }

    #[test]
    fn fields_combine_with_and() {
        let p = Product::new("Mug")
            .with_status(ProductStatus::Published)
            .with_tag("kitchen")
            .with_collection("Summer", "summer");

        let f = ProductFilter {
            status: Some(vec![ProductStatus::Published]),
            tags: Some(vec!["garden".to_string(), "kitchen".to_string()]),
            collection: Some(vec!["summer".to_string()]),
            ..Default::default()
        };
        assert!(f.matches(&p));

        let f = ProductFilter {
            status: Some(vec![ProductStatus::Draft]),
            tags: Some(vec!["kitchen".to_string()]),
            ..Default::default()
        };
        assert!(!f.matches(&p));
    }

    #[test]
    fn created_window_is_exclusive() {
        let p = Product::new("Lamp");
        let f = ProductFilter {
            created_after: Some(p.created_at - Duration::seconds(1)),
            created_before: Some(p.created_at + Duration::seconds(1)),
            ..Default::default()
        };
        assert!(f.matches(&p));

        let f = ProductFilter {
            created_after: Some(p.created_at),
            ..Default::default()
        };
        assert!(!f.matches(&p));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_value::<ProductFilter>(serde_json::json!({ "colour": "red" }));
        assert!(err.is_err());

        let ok: ProductFilter =
            serde_json::from_value(serde_json::json!({ "title": "Test export product" })).unwrap();
        assert_eq!(ok, ProductFilter::by_title("Test export product"));
    }

    #[test]
    fn validate_rejects_empty_lists_and_inverted_window() {
        let f = ProductFilter {
            tags: Some(vec![]),
            ..Default::default()
        };
        assert!(matches!(f.validate(), Err(DomainError::Validation(_))));

        let now = Utc::now();
        let f = ProductFilter {
            created_after: Some(now),
            created_before: Some(now),
            ..Default::default()
        };
        assert!(f.validate().is_err());
        assert!(ProductFilter::default().validate().is_ok());
    }
}
