// =============================================================================
// ASSIGNMENT SERVICE
// =============================================================================
// Grants package definitions to users and reads the resulting instances.
//
// `assign` is all-or-nothing: one foreign, unknown or repeated user id rejects
// the whole request before anything is written.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::auth::{CorrelationId, Principal};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    AssignPackageRequest, AssignmentDetail, AssignmentInstance, AssignmentStatus, UserSummary,
};
use crate::policy;
use crate::AppState;

use super::{packages, timed};

pub async fn assign(
    state: &AppState,
    actor: &Principal,
    package_id: Uuid,
    request: AssignPackageRequest,
    correlation_id: CorrelationId,
) -> AppResult<Vec<AssignmentInstance>> {
    let company_id = packages::admin_scope(actor)?;
    request.validate()?;

    timed("get_package", state.store.get_package(package_id, company_id))
        .await?
        .ok_or_else(packages::not_found)?;

    // The store counts distinct members, so a repeated id also fails here.
    let members = timed(
        "count_company_users",
        state.store.count_company_users(company_id, &request.user_ids),
    )
    .await?;
    if members != request.user_ids.len() {
        tracing::warn!(
            %correlation_id,
            %package_id,
            requested = request.user_ids.len(),
            members,
            "Assignment rejected: users outside the company"
        );
        return Err(AppError::Forbidden(
            "Some users do not belong to your company".into(),
        ));
    }

    let now = Utc::now();
    let instances: Vec<AssignmentInstance> = request
        .user_ids
        .iter()
        .map(|&user_id| AssignmentInstance {
            id: Uuid::new_v4(),
            user_id,
            package_id,
            assigned_at: now,
            expiry_date: request.expiry_date,
            status: AssignmentStatus::Active,
            completed_at: None,
        })
        .collect();

    timed("insert_assignments", state.store.insert_assignments(&instances)).await?;
    metrics::record_assignments(instances.len());

    tracing::info!(
        %correlation_id,
        %package_id,
        assigned = instances.len(),
        assigned_by = %actor.id,
        "Package assigned"
    );
    Ok(instances)
}

/// Every instance of one of the caller's company packages, each with its
/// holder.
pub async fn list_for_package(
    state: &AppState,
    actor: &Principal,
    package_id: Uuid,
) -> AppResult<Vec<AssignmentDetail>> {
    let company_id = packages::admin_scope(actor)?;
    timed("get_package", state.store.get_package(package_id, company_id))
        .await?
        .ok_or_else(packages::not_found)?;

    let records = timed(
        "list_package_assignments",
        state.store.list_package_assignments(package_id),
    )
    .await?;

    let holder_ids: Vec<Uuid> = records.iter().map(|r| r.instance.user_id).collect();
    let holders: HashMap<Uuid, UserSummary> =
        timed("users_by_ids", state.store.users_by_ids(&holder_ids))
            .await?
            .iter()
            .map(|user| (user.id, UserSummary::from(user)))
            .collect();

    Ok(records
        .into_iter()
        .map(|record| {
            let user = holders.get(&record.instance.user_id).cloned();
            AssignmentDetail {
                user,
                ..AssignmentDetail::from(record)
            }
        })
        .collect())
}

/// The caller's own instances, any status.
pub async fn list_for_user(state: &AppState, actor: &Principal) -> AppResult<Vec<AssignmentDetail>> {
    let records = timed(
        "list_user_assignments",
        state.store.list_user_assignments(actor.id),
    )
    .await?;
    Ok(records.into_iter().map(AssignmentDetail::from).collect())
}

pub async fn get_instance(
    state: &AppState,
    actor: &Principal,
    instance_id: Uuid,
) -> AppResult<AssignmentDetail> {
    let record = timed("get_assignment", state.store.get_assignment(instance_id))
        .await?
        .ok_or_else(|| AppError::NotFound("User package not found".into()))?;
    policy::can_view_assignment(actor, &record.instance).into_result()?;
    Ok(record.into())
}
