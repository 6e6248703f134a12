// =============================================================================
// DIRECTORY SERVICE
// =============================================================================
// Companies and users. Tenancy for everything else hangs off these rows.
//
// NOTES:
// - Company management is SuperAdmin only; `list_public_companies` is open to
//   any authenticated caller
// - A company cannot be deleted while it still has users
// - Deleting a user drops their instances and redemption history
// =============================================================================

use chrono::Utc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::models::{
    validate_role_company, Company, CreateCompanyRequest, CreateUserRequest,
    UpdateCompanyRequest, UpdateUserRequest, User,
};
use crate::policy;
use crate::AppState;

use super::timed;

// -----------------------------------------------------------------------------
// COMPANIES
// -----------------------------------------------------------------------------

pub async fn create_company(
    state: &AppState,
    actor: &Principal,
    request: CreateCompanyRequest,
) -> AppResult<Company> {
    policy::can_manage_companies(actor).into_result()?;
    request.validate()?;

    let now = Utc::now();
    let company = Company {
        id: Uuid::new_v4(),
        name: request.name.trim().to_string(),
        created_at: now,
        updated_at: now,
    };
    timed("insert_company", state.store.insert_company(&company)).await?;

    tracing::info!(company_id = %company.id, name = %company.name, "Company created");
    Ok(company)
}

pub async fn list_companies(state: &AppState, actor: &Principal) -> AppResult<Vec<Company>> {
    policy::can_manage_companies(actor).into_result()?;
    timed("list_companies", state.store.list_companies()).await
}

pub async fn get_company(state: &AppState, actor: &Principal, id: Uuid) -> AppResult<Company> {
    policy::can_manage_companies(actor).into_result()?;
    timed("get_company", state.store.get_company(id))
        .await?
        .ok_or_else(|| AppError::NotFound("Company not found".into()))
}

/// Company list for any authenticated caller (sign-up and pickers).
pub async fn list_public_companies(state: &AppState) -> AppResult<Vec<Company>> {
    timed("list_companies", state.store.list_companies()).await
}

pub async fn update_company(
    state: &AppState,
    actor: &Principal,
    id: Uuid,
    patch: UpdateCompanyRequest,
) -> AppResult<Company> {
    let mut company = get_company(state, actor, id).await?;
    patch.validate()?;

    if let Some(name) = patch.name {
        company.name = name.trim().to_string();
    }
    company.updated_at = Utc::now();
    timed("update_company", state.store.update_company(&company)).await?;

    tracing::info!(company_id = %id, name = %company.name, "Company updated");
    Ok(company)
}

pub async fn delete_company(state: &AppState, actor: &Principal, id: Uuid) -> AppResult<()> {
    policy::can_manage_companies(actor).into_result()?;
    if !timed("delete_company", state.store.delete_company(id)).await? {
        return Err(AppError::NotFound("Company not found".into()));
    }

    tracing::info!(company_id = %id, deleted_by = %actor.id, "Company deleted");
    Ok(())
}

// -----------------------------------------------------------------------------
// USERS
// -----------------------------------------------------------------------------

async fn find_user(state: &AppState, id: Uuid) -> AppResult<User> {
    timed("get_user", state.store.get_user(id))
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))
}

pub async fn create_user(
    state: &AppState,
    actor: &Principal,
    request: CreateUserRequest,
) -> AppResult<User> {
    request.validate()?;
    let role = request.role();
    policy::can_create_user(actor, role, request.company_id).into_result()?;

    if let Some(company_id) = request.company_id {
        timed("get_company", state.store.get_company(company_id))
            .await?
            .ok_or_else(|| AppError::NotFound("Company not found".into()))?;
    }

    let user = User {
        id: Uuid::new_v4(),
        email: request.email.trim().to_lowercase(),
        first_name: request.first_name,
        last_name: request.last_name,
        role,
        company_id: request.company_id,
        created_at: Utc::now(),
    };
    timed("insert_user", state.store.insert_user(&user)).await?;

    tracing::info!(
        user_id = %user.id,
        role = user.role.as_str(),
        created_by = %actor.id,
        "User created"
    );
    Ok(user)
}

/// SuperAdmin sees every user, everyone else their own company.
pub async fn list_users(state: &AppState, actor: &Principal) -> AppResult<Vec<User>> {
    let scope = policy::user_listing_scope(actor)?;
    timed("list_users", state.store.list_users(scope)).await
}

/// The caller's own user row.
pub async fn me(state: &AppState, actor: &Principal) -> AppResult<User> {
    find_user(state, actor.id).await
}

pub async fn get_user(state: &AppState, actor: &Principal, id: Uuid) -> AppResult<User> {
    let user = find_user(state, id).await?;
    policy::can_view_user(actor, &user).into_result()?;
    Ok(user)
}

/// Partial update. The merged row must satisfy the same role and company
/// rules as a newly created one, from the actor's point of view.
pub async fn update_user(
    state: &AppState,
    actor: &Principal,
    id: Uuid,
    patch: UpdateUserRequest,
) -> AppResult<User> {
    let mut user = find_user(state, id).await?;
    policy::can_modify_user(actor, &user).into_result()?;
    patch.validate()?;

    if let Some(email) = patch.email {
        user.email = email.trim().to_lowercase();
    }
    if let Some(first_name) = patch.first_name {
        user.first_name = first_name;
    }
    if let Some(last_name) = patch.last_name {
        user.last_name = last_name;
    }
    if let Some(role) = patch.role {
        user.role = role;
    }
    if patch.company_id.is_some() {
        user.company_id = patch.company_id;
    }

    validate_role_company(user.role, user.company_id)?;
    policy::can_create_user(actor, user.role, user.company_id).into_result()?;
    if let Some(company_id) = patch.company_id {
        timed("get_company", state.store.get_company(company_id))
            .await?
            .ok_or_else(|| AppError::NotFound("Company not found".into()))?;
    }

    timed("update_user", state.store.update_user(&user)).await?;

    tracing::info!(
        user_id = %user.id,
        role = user.role.as_str(),
        updated_by = %actor.id,
        "User updated"
    );
    Ok(user)
}

pub async fn delete_user(state: &AppState, actor: &Principal, id: Uuid) -> AppResult<()> {
    let user = find_user(state, id).await?;
    policy::can_modify_user(actor, &user).into_result()?;

    if !timed("delete_user", state.store.delete_user(id)).await? {
        return Err(AppError::NotFound("User not found".into()));
    }

    tracing::info!(user_id = %id, deleted_by = %actor.id, "User deleted");
    Ok(())
}
