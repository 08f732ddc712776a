use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use forgebatch_core::{DomainError, DomainResult, ProductId, VariantId};

/// Identifier of a product option (e.g. "size"), scoped to its product.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionId(pub Uuid);

impl OptionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for OptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Product publication lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    Draft,
    Proposed,
    Published,
    Rejected,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Draft => "draft",
            ProductStatus::Proposed => "proposed",
            ProductStatus::Published => "published",
            ProductStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCollection {
    pub title: String,
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductType {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductTag {
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShippingProfileType {
    Default,
    GiftCard,
    Custom,
}

impl ShippingProfileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShippingProfileType::Default => "default",
            ShippingProfileType::GiftCard => "gift_card",
            ShippingProfileType::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingProfile {
    pub name: String,
    pub profile_type: ShippingProfileType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductImage {
    pub url: String,
}

/// A configurable product dimension (e.g. "size", "color").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductOption {
    pub id: OptionId,
    pub title: String,
}

/// The value a variant takes for one product option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantOptionValue {
    pub option_id: OptionId,
    pub value: String,
}

/// Price in the smallest currency unit (e.g. cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyAmount {
    /// ISO 4217 code, stored lower-case (e.g. "usd").
    pub currency_code: String,
    pub amount: i64,
}

/// Purchasable variant of a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductVariant {
    pub id: VariantId,
    pub title: String,
    pub sku: Option<String>,
    pub barcode: Option<String>,
    pub inventory_quantity: i64,
    pub allow_backorder: bool,
    pub manage_inventory: bool,
    pub weight: Option<f64>,
    pub length: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub hs_code: Option<String>,
    pub origin_country: Option<String>,
    pub mid_code: Option<String>,
    pub material: Option<String>,
    pub prices: Vec<MoneyAmount>,
    pub options: Vec<VariantOptionValue>,
}

impl ProductVariant {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: VariantId::new(),
            title: title.into(),
            sku: None,
            barcode: None,
            inventory_quantity: 0,
            allow_backorder: false,
            manage_inventory: true,
            weight: None,
            length: None,
            width: None,
            height: None,
            hs_code: None,
            origin_country: None,
            mid_code: None,
            material: None,
            prices: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    pub fn with_inventory_quantity(mut self, quantity: i64) -> Self {
        self.inventory_quantity = quantity;
        self
    }

    pub fn with_price(mut self, currency_code: impl Into<String>, amount: i64) -> Self {
        self.prices.push(MoneyAmount {
            currency_code: currency_code.into().to_lowercase(),
            amount,
        });
        self
    }

    pub fn with_option_value(mut self, option_id: OptionId, value: impl Into<String>) -> Self {
        self.options.push(VariantOptionValue {
            option_id,
            value: value.into(),
        });
        self
    }

    /// Price for a currency code (case-insensitive), if the variant has one.
    pub fn price_for(&self, currency_code: &str) -> Option<i64> {
        self.prices
            .iter()
            .find(|p| p.currency_code.eq_ignore_ascii_case(currency_code))
            .map(|p| p.amount)
    }
}

/// Catalog product as read by exports (read model, not an aggregate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub handle: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub status: ProductStatus,
    pub thumbnail: Option<String>,
    pub weight: Option<f64>,
    pub length: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub hs_code: Option<String>,
    pub origin_country: Option<String>,
    pub mid_code: Option<String>,
    pub material: Option<String>,
    pub collection: Option<ProductCollection>,
    pub product_type: Option<ProductType>,
    pub tags: Vec<ProductTag>,
    pub discountable: bool,
    pub external_id: Option<String>,
    pub profile: Option<ShippingProfile>,
    pub options: Vec<ProductOption>,
    pub variants: Vec<ProductVariant>,
    pub images: Vec<ProductImage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// New draft product; the handle is derived from the title.
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        let now = Utc::now();
        Self {
            id: ProductId::new(),
            handle: slugify(&title),
            title,
            subtitle: None,
            description: None,
            status: ProductStatus::Draft,
            thumbnail: None,
            weight: None,
            length: None,
            width: None,
            height: None,
            hs_code: None,
            origin_country: None,
            mid_code: None,
            material: None,
            collection: None,
            product_type: None,
            tags: Vec::new(),
            discountable: true,
            external_id: None,
            profile: None,
            options: Vec::new(),
            variants: Vec::new(),
            images: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_status(mut self, status: ProductStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_collection(mut self, title: impl Into<String>, handle: impl Into<String>) -> Self {
        self.collection = Some(ProductCollection {
            title: title.into(),
            handle: handle.into(),
        });
        self
    }

    pub fn with_type(mut self, value: impl Into<String>) -> Self {
        self.product_type = Some(ProductType {
            value: value.into(),
        });
        self
    }

    pub fn with_tag(mut self, value: impl Into<String>) -> Self {
        self.tags.push(ProductTag {
            value: value.into(),
        });
        self
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.images.push(ProductImage { url: url.into() });
        self
    }

    /// Add an option and return its id alongside the product.
    pub fn with_option(mut self, title: impl Into<String>) -> (Self, OptionId) {
        let id = OptionId::new();
        self.options.push(ProductOption {
            id,
            title: title.into(),
        });
        (self, id)
    }

    pub fn with_variant(mut self, variant: ProductVariant) -> Self {
        self.variants.push(variant);
        self
    }

    /// Find an option by id.
    pub fn option(&self, id: OptionId) -> Option<&ProductOption> {
        self.options.iter().find(|o| o.id == id)
    }

    /// Check structural invariants between variants and options.
    ///
    /// Every variant option value must reference an option declared on the
    /// product, and no variant may set the same option twice.
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.title.trim().is_empty() {
            return Err(DomainError::invariant(format!(
                "product {} has an empty title",
                self.id
            )));
        }

        for variant in &self.variants {
            let mut seen = Vec::with_capacity(variant.options.len());
            for value in &variant.options {
                if self.option(value.option_id).is_none() {
                    return Err(DomainError::invariant(format!(
                        "variant {} references unknown option {}",
                        variant.id, value.option_id.0
                    )));
                }
                if seen.contains(&value.option_id) {
                    return Err(DomainError::invariant(format!(
                        "variant {} sets option {} twice",
                        variant.id, value.option_id.0
                    )));
                }
                seen.push(value.option_id);
            }
        }

        Ok(())
    }
}

fn slugify(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}
