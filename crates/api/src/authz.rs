//! API-side authorization guards.
//!
//! Checked in handlers before touching the orchestrator, so infra stays
//! auth-agnostic.

use forgebatch_auth::{authorize, AuthzError, Permission};
use forgebatch_core::UserId;

use crate::context::PrincipalContext;

pub fn require(principal: &PrincipalContext, permission: &Permission) -> Result<(), AuthzError> {
    authorize(&principal.principal(), permission)
}

/// Jobs are visible to their creator; a wildcard grant sees everything.
pub fn ensure_owner(principal: &PrincipalContext, created_by: UserId) -> Result<(), AuthzError> {
    if principal.user_id() == created_by
        || principal.principal().permissions.iter().any(|p| p.is_wildcard())
    {
        return Ok(());
    }
    Err(AuthzError::NotOwner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgebatch_auth::{permissions::batch_jobs, Role};

    #[test]
    fn owner_and_admin_pass_the_ownership_check() {
        let owner = UserId::new();
        let me = PrincipalContext::new(owner, vec![Role::new("viewer")]);
        let admin = PrincipalContext::new(UserId::new(), vec![Role::new("admin")]);
        let stranger = PrincipalContext::new(UserId::new(), vec![Role::new("viewer")]);

        assert!(ensure_owner(&me, owner).is_ok());
        assert!(ensure_owner(&admin, owner).is_ok());
        assert!(ensure_owner(&stranger, owner).is_err());
    }

    #[test]
    fn viewer_cannot_create() {
        let viewer = PrincipalContext::new(UserId::new(), vec![Role::new("viewer")]);
        assert!(require(&viewer, &batch_jobs::READ).is_ok());
        assert!(require(&viewer, &batch_jobs::CREATE).is_err());
    }
}
