//! `forgebatch-core`: shared domain primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{BatchJobId, ProductId, UserId, VariantId};
pub use version::ExpectedVersion;
