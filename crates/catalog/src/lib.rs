//! Catalog records consumed by exports.
//!
//! Pure data + predicates: no IO, no HTTP, no storage. The paginated read
//! adapter over these records lives in `forgebatch-infra`.

pub mod filter;
pub mod product;

pub use filter::ProductFilter;
pub use product::{
    MoneyAmount, OptionId, Product, ProductCollection, ProductImage, ProductOption, ProductStatus,
    ProductTag, ProductType, ProductVariant, ShippingProfile, ShippingProfileType,
    VariantOptionValue,
};
