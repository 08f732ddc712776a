use std::collections::HashSet;

use thiserror::Error;

use forgebatch_core::UserId;

use crate::{Permission, Role};

/// A resolved principal for authorization decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
}

impl Principal {
    /// Build a principal whose permissions derive from its roles.
    pub fn from_roles(user_id: UserId, roles: Vec<Role>) -> Self {
        let permissions = permissions_from_roles(&roles);
        Self {
            user_id,
            roles,
            permissions,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),

    #[error("forbidden: resource belongs to another user")]
    NotOwner,
}

/// Authorize a principal for a single permission.
///
/// Pure policy check: no IO, no panics.
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    let perms: HashSet<&str> = principal.permissions.iter().map(|p| p.as_str()).collect();

    if perms.contains("*") || perms.contains(required.as_str()) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

/// Minimal role→permission mapping.
///
/// `admin` grants everything; `viewer` may only read batch jobs.
pub fn permissions_from_roles(roles: &[Role]) -> Vec<Permission> {
    if roles.iter().any(|r| r.as_str() == "admin") {
        return vec![Permission::new("*")];
    }

    if roles.iter().any(|r| r.as_str() == "viewer") {
        return vec![crate::permissions::batch_jobs::READ.clone()];
    }

    Vec::new()
}
