// =============================================================================
// POLICY MODULE
// =============================================================================
// One function per action. Each returns an explicit `Decision` with a reason,
// so the rules can be tested without HTTP or storage.
//
// A denial is either `Forbidden` (the caller may know the target exists) or
// `Concealed` (reported as NotFound so existence does not leak).
// =============================================================================

use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::models::{AssignmentInstance, Role, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialKind {
    Forbidden,
    Concealed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { kind: DenialKind, reason: String },
}

impl Decision {
    fn forbid(reason: impl Into<String>) -> Self {
        Decision::Deny {
            kind: DenialKind::Forbidden,
            reason: reason.into(),
        }
    }

    fn conceal(reason: impl Into<String>) -> Self {
        Decision::Deny {
            kind: DenialKind::Concealed,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// `Ok(())` when allowed, otherwise the matching error kind.
    pub fn into_result(self) -> AppResult<()> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny {
                kind: DenialKind::Forbidden,
                reason,
            } => Err(AppError::Forbidden(reason)),
            Decision::Deny {
                kind: DenialKind::Concealed,
                reason,
            } => Err(AppError::NotFound(reason)),
        }
    }
}

// -----------------------------------------------------------------------------
// TENANCY
// -----------------------------------------------------------------------------

/// Company the actor operates in; company-scoped routes require one.
pub fn company_scope(actor: &Principal) -> AppResult<Uuid> {
    actor
        .company_id
        .ok_or_else(|| AppError::Forbidden("User must belong to a company".into()))
}

// -----------------------------------------------------------------------------
// ADMINISTRATION
// -----------------------------------------------------------------------------

pub fn can_manage_packages(actor: &Principal) -> Decision {
    match actor.role {
        Role::CompanyAdmin | Role::SuperAdmin => Decision::Allow,
        Role::User => Decision::forbid("Managing packages requires an admin role"),
    }
}

pub fn can_manage_inventory(actor: &Principal) -> Decision {
    match actor.role {
        Role::CompanyAdmin => Decision::Allow,
        _ => Decision::forbid("Managing inventory requires the CompanyAdmin role"),
    }
}

pub fn can_manage_companies(actor: &Principal) -> Decision {
    match actor.role {
        Role::SuperAdmin => Decision::Allow,
        _ => Decision::forbid("Managing companies requires the SuperAdmin role"),
    }
}

/// Who may create a user with `target_role` inside `target_company`.
///
/// - SuperAdmin: anyone, anywhere
/// - CompanyAdmin: only plain users, only in their own company
/// - User: nobody
pub fn can_create_user(
    actor: &Principal,
    target_role: Role,
    target_company: Option<Uuid>,
) -> Decision {
    match actor.role {
        Role::SuperAdmin => Decision::Allow,
        Role::CompanyAdmin => {
            if target_company.is_none() || target_company != actor.company_id {
                Decision::forbid("You can only create users in your own company")
            } else if target_role != Role::User {
                Decision::forbid("CompanyAdmin cannot create SuperAdmin or CompanyAdmin users")
            } else {
                Decision::Allow
            }
        }
        Role::User => Decision::forbid("Users cannot create other users"),
    }
}

/// SuperAdmin sees any user; CompanyAdmin only users of their own company.
pub fn can_view_user(actor: &Principal, target: &User) -> Decision {
    match actor.role {
        Role::SuperAdmin => Decision::Allow,
        Role::CompanyAdmin
            if target.company_id.is_some() && target.company_id == actor.company_id =>
        {
            Decision::Allow
        }
        Role::CompanyAdmin => Decision::forbid("You do not have access to this user"),
        Role::User => Decision::forbid("Viewing users requires an admin role"),
    }
}

/// Update or delete `target`. On top of `can_view_user`, a CompanyAdmin may
/// only touch plain users.
pub fn can_modify_user(actor: &Principal, target: &User) -> Decision {
    let decision = can_view_user(actor, target);
    if !decision.is_allowed() {
        return decision;
    }
    if actor.role == Role::CompanyAdmin && target.role != Role::User {
        return Decision::forbid("You cannot modify SuperAdmin or CompanyAdmin users");
    }
    Decision::Allow
}

/// Company filter for listing users: `None` means every company.
pub fn user_listing_scope(actor: &Principal) -> AppResult<Option<Uuid>> {
    match actor.role {
        Role::SuperAdmin => Ok(None),
        _ => company_scope(actor).map(Some),
    }
}

// -----------------------------------------------------------------------------
// ASSIGNMENTS & REDEMPTION
// -----------------------------------------------------------------------------

/// Only the holder of an instance may view it through the end-user routes.
pub fn can_view_assignment(actor: &Principal, instance: &AssignmentInstance) -> Decision {
    if instance.user_id == actor.id {
        Decision::Allow
    } else {
        Decision::conceal("User package not found")
    }
}

/// Only the holder of an instance may redeem from it.
pub fn can_redeem(actor: &Principal, instance: &AssignmentInstance) -> Decision {
    if instance.user_id == actor.id {
        Decision::Allow
    } else {
        Decision::conceal("User package not found")
    }
}
