//! `forgebatch-auth`: thin authentication/authorization boundary.
//!
//! Decoupled from HTTP and storage: the API layer extracts the bearer token,
//! this crate validates it and answers permission checks.

pub mod authorize;
pub mod claims;
pub mod jwt;
pub mod permissions;
pub mod roles;

pub use authorize::{authorize, permissions_from_roles, AuthzError, Principal};
pub use claims::{validate_claims, JwtClaims, TokenValidationError};
pub use jwt::{Hs256JwtValidator, JwtValidator};
pub use permissions::Permission;
pub use roles::Role;
