// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers (controller layer).
//
// NOTES:
// - Taking a `Principal` argument makes a route require a valid bearer token
// - `CorrelationId` is set by `middleware::correlation_id`
// - Handlers only extract, call one service function and shape the response;
//   rules live in `services`, `policy` and `ledger`
// - Bodies and path ids go through `AppJson` / `AppPath`, so malformed input
//   gets the usual VALIDATION_ERROR body
// =============================================================================

use axum::{
    extract::{FromRequest, FromRequestParts, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{CorrelationId, Principal};
use crate::error::{AppError, AppResult};
use crate::models::*;
use crate::services::{assignments, directory, inventory, packages, redemption};
use crate::AppState;

/// `Json` body whose rejection is an `AppError::Validation`.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

/// `Path` whose rejection (e.g. a non-UUID id) is an `AppError::Validation`.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(AppError))]
pub struct AppPath<T>(pub T);

type Created<T> = (StatusCode, Json<T>);

fn created<T>(body: T) -> Created<T> {
    (StatusCode::CREATED, Json(body))
}

fn message(text: &str) -> Json<MessageResponse> {
    Json(MessageResponse {
        message: text.to_string(),
    })
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "package-redemption-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe: storage must answer, and the cache too when configured.
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let storage = state.store.health_check().await;
    let cache = match &state.cache {
        Some(cache) => Some(cache.ping().await),
        None => None,
    };

    let ready = storage && cache.unwrap_or(true);
    let response = ReadinessResponse {
        status: if ready { "ready" } else { "not_ready" }.to_string(),
        checks: ReadinessChecks { storage, cache },
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// Prometheus metrics in text exposition format
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// PACKAGE DEFINITIONS
// =============================================================================

/// POST /packages
///
/// ```json
/// { "name": "10 Water Bottles", "items": [{ "inventoryItemId": "…", "quantity": 10 }] }
/// ```
pub async fn create_package(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppJson(request): AppJson<CreatePackageRequest>,
) -> AppResult<Created<PackageDefinition>> {
    packages::create(&state, &actor, request).await.map(created)
}

/// GET /packages
pub async fn list_packages(
    State(state): State<Arc<AppState>>,
    actor: Principal,
) -> AppResult<Json<Vec<PackageDefinition>>> {
    packages::find_all(&state, &actor).await.map(Json)
}

/// GET /packages/:id
pub async fn get_package(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
) -> AppResult<Json<PackageDefinition>> {
    packages::find_one(&state, &actor, id).await.map(Json)
}

/// PATCH /packages/:id
///
/// `items`, when present, replaces the whole line-item set.
pub async fn update_package(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
    AppJson(patch): AppJson<UpdatePackageRequest>,
) -> AppResult<Json<PackageDefinition>> {
    packages::update(&state, &actor, id, patch).await.map(Json)
}

/// DELETE /packages/:id
pub async fn delete_package(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    packages::remove(&state, &actor, id).await?;
    Ok(message("Package deleted successfully"))
}

// =============================================================================
// ASSIGNMENTS
// =============================================================================

/// POST /packages/:id/assign
///
/// ```json
/// { "userIds": ["…", "…"], "expiryDate": "2026-12-31T00:00:00Z" }
/// ```
pub async fn assign_package(
    State(state): State<Arc<AppState>>,
    correlation_id: CorrelationId,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
    AppJson(request): AppJson<AssignPackageRequest>,
) -> AppResult<Created<Vec<AssignmentInstance>>> {
    assignments::assign(&state, &actor, id, request, correlation_id)
        .await
        .map(created)
}

/// GET /packages/:id/users
pub async fn package_assignments(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
) -> AppResult<Json<Vec<AssignmentDetail>>> {
    assignments::list_for_package(&state, &actor, id)
        .await
        .map(Json)
}

/// GET /packages/my-packages
pub async fn my_packages(
    State(state): State<Arc<AppState>>,
    actor: Principal,
) -> AppResult<Json<Vec<AssignmentDetail>>> {
    assignments::list_for_user(&state, &actor).await.map(Json)
}

/// GET /packages/user-package/:id
pub async fn get_user_package(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
) -> AppResult<Json<AssignmentDetail>> {
    assignments::get_instance(&state, &actor, id).await.map(Json)
}

// =============================================================================
// REDEMPTION
// =============================================================================

/// POST /packages/user-package/:id/redeem
///
/// ```json
/// { "inventoryItemId": "…", "quantity": 4, "notes": "front desk" }
/// ```
///
/// # Response
/// - 201 Created: the redemption event with its inventory item
/// - 404 Not Found: instance not held by the caller, or item not in package
/// - 409 Conflict: instance not active, or more than what remains
pub async fn redeem_item(
    State(state): State<Arc<AppState>>,
    correlation_id: CorrelationId,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
    AppJson(request): AppJson<RedeemItemRequest>,
) -> AppResult<Created<RedemptionView>> {
    redemption::redeem(&state, &actor, id, request, correlation_id)
        .await
        .map(created)
}

// =============================================================================
// INVENTORY
// =============================================================================

/// POST /inventory
pub async fn create_inventory(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppJson(request): AppJson<CreateInventoryRequest>,
) -> AppResult<Created<InventoryItem>> {
    inventory::create(&state, &actor, request).await.map(created)
}

/// GET /inventory
pub async fn list_inventory(
    State(state): State<Arc<AppState>>,
    actor: Principal,
) -> AppResult<Json<Vec<InventoryItem>>> {
    inventory::find_all(&state, &actor).await.map(Json)
}

/// GET /inventory/:id
pub async fn get_inventory(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
) -> AppResult<Json<InventoryItem>> {
    inventory::find_one(&state, &actor, id).await.map(Json)
}

/// PATCH /inventory/:id
pub async fn update_inventory(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
    AppJson(patch): AppJson<UpdateInventoryRequest>,
) -> AppResult<Json<InventoryItem>> {
    inventory::update(&state, &actor, id, patch).await.map(Json)
}

/// DELETE /inventory/:id
pub async fn delete_inventory(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    inventory::remove(&state, &actor, id).await?;
    Ok(message("Inventory item deleted successfully"))
}

// =============================================================================
// COMPANIES & USERS
// =============================================================================

/// POST /companies
pub async fn create_company(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppJson(request): AppJson<CreateCompanyRequest>,
) -> AppResult<Created<Company>> {
    directory::create_company(&state, &actor, request)
        .await
        .map(created)
}

/// GET /companies
pub async fn list_companies(
    State(state): State<Arc<AppState>>,
    actor: Principal,
) -> AppResult<Json<Vec<Company>>> {
    directory::list_companies(&state, &actor).await.map(Json)
}

/// GET /companies/public
///
/// Any authenticated caller.
pub async fn list_public_companies(
    State(state): State<Arc<AppState>>,
    _actor: Principal,
) -> AppResult<Json<Vec<Company>>> {
    directory::list_public_companies(&state).await.map(Json)
}

/// GET /companies/:id
pub async fn get_company(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
) -> AppResult<Json<Company>> {
    directory::get_company(&state, &actor, id).await.map(Json)
}

/// POST /users
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppJson(request): AppJson<CreateUserRequest>,
) -> AppResult<Created<User>> {
    directory::create_user(&state, &actor, request)
        .await
        .map(created)
}

/// GET /users
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    actor: Principal,
) -> AppResult<Json<Vec<User>>> {
    directory::list_users(&state, &actor).await.map(Json)
}

/// PATCH /companies/:id
pub async fn update_company(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
    AppJson(patch): AppJson<UpdateCompanyRequest>,
) -> AppResult<Json<Company>> {
    directory::update_company(&state, &actor, id, patch)
        .await
        .map(Json)
}

/// DELETE /companies/:id
///
/// 409 while the company still has users.
pub async fn delete_company(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    directory::delete_company(&state, &actor, id).await?;
    Ok(message("Company deleted successfully"))
}

/// GET /users/me
pub async fn current_user(
    State(state): State<Arc<AppState>>,
    actor: Principal,
) -> AppResult<Json<User>> {
    directory::me(&state, &actor).await.map(Json)
}

/// GET /users/:id
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
) -> AppResult<Json<User>> {
    directory::get_user(&state, &actor, id).await.map(Json)
}

/// PATCH /users/:id
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
    AppJson(patch): AppJson<UpdateUserRequest>,
) -> AppResult<Json<User>> {
    directory::update_user(&state, &actor, id, patch)
        .await
        .map(Json)
}

/// DELETE /users/:id
///
/// Also removes the user's package instances and their redemptions.
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    actor: Principal,
    AppPath(id): AppPath<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    directory::delete_user(&state, &actor, id).await?;
    Ok(message("User deleted successfully"))
}
