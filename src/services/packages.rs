// =============================================================================
// PACKAGE DEFINITION SERVICE
// =============================================================================
// CRUD for company-owned package definitions.
//
// NOTES:
// - Every operation is scoped by (id, companyId); other tenants see NotFound
// - Line items must reference inventory of the same company
// - `find_one` reads through the Redis cache when one is configured;
//   `update` and `remove` invalidate it
// - Replacing the line items completes every active instance the new set
//   leaves with nothing to redeem
// =============================================================================

use chrono::Utc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    CreatePackageRequest, PackageDefinition, PackageItem, PackageItemInput, UpdatePackageRequest,
};
use crate::policy;
use crate::AppState;

use super::timed;

/// Company the actor administers packages for.
pub(crate) fn admin_scope(actor: &Principal) -> AppResult<Uuid> {
    policy::can_manage_packages(actor).into_result()?;
    policy::company_scope(actor)
}

pub(crate) fn not_found() -> AppError {
    AppError::NotFound("Package not found".into())
}

/// Every referenced inventory item must belong to `company_id`.
async fn ensure_company_inventory(
    state: &AppState,
    company_id: Uuid,
    items: &[PackageItemInput],
) -> AppResult<()> {
    let ids: Vec<Uuid> = items.iter().map(|item| item.inventory_item_id).collect();
    let owned = timed(
        "count_company_inventory",
        state.store.count_company_inventory(company_id, &ids),
    )
    .await?;

    if owned != ids.len() {
        return Err(AppError::NotFound(
            "One or more inventory items not found".into(),
        ));
    }
    Ok(())
}

fn line_items(package_id: Uuid, items: Vec<PackageItemInput>) -> Vec<PackageItem> {
    items
        .into_iter()
        .map(|input| PackageItem {
            id: Uuid::new_v4(),
            package_id,
            inventory_item_id: input.inventory_item_id,
            quantity: input.quantity,
        })
        .collect()
}

pub async fn create(
    state: &AppState,
    actor: &Principal,
    request: CreatePackageRequest,
) -> AppResult<PackageDefinition> {
    let company_id = admin_scope(actor)?;
    request.validate()?;
    ensure_company_inventory(state, company_id, &request.items).await?;

    let id = Uuid::new_v4();
    let now = Utc::now();
    let package = PackageDefinition {
        id,
        company_id,
        name: request.name,
        description: request.description,
        items: line_items(id, request.items),
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    timed("insert_package", state.store.insert_package(&package)).await?;

    tracing::info!(
        package_id = %package.id,
        %company_id,
        items = package.items.len(),
        "Package created"
    );
    Ok(package)
}

pub async fn find_all(state: &AppState, actor: &Principal) -> AppResult<Vec<PackageDefinition>> {
    let company_id = admin_scope(actor)?;
    timed("list_packages", state.store.list_packages(company_id)).await
}

/// Load a definition of the caller's company, through the cache when present.
pub(crate) async fn load(
    state: &AppState,
    id: Uuid,
    company_id: Uuid,
) -> AppResult<PackageDefinition> {
    if let Some(cache) = &state.cache {
        if let Some(package) = cache.get(company_id, id).await {
            tracing::debug!(package_id = %id, "Package cache hit");
            return Ok(package);
        }
    }

    let package = timed("get_package", state.store.get_package(id, company_id))
        .await?
        .ok_or_else(not_found)?;

    if let Some(cache) = &state.cache {
        cache.put(&package).await;
    }
    Ok(package)
}

pub async fn find_one(
    state: &AppState,
    actor: &Principal,
    id: Uuid,
) -> AppResult<PackageDefinition> {
    let company_id = admin_scope(actor)?;
    load(state, id, company_id).await
}

pub async fn update(
    state: &AppState,
    actor: &Principal,
    id: Uuid,
    patch: UpdatePackageRequest,
) -> AppResult<PackageDefinition> {
    let company_id = admin_scope(actor)?;
    patch.validate()?;

    let mut package = timed("get_package", state.store.get_package(id, company_id))
        .await?
        .ok_or_else(not_found)?;

    if let Some(name) = patch.name {
        package.name = name;
    }
    if patch.description.is_some() {
        package.description = patch.description;
    }
    if let Some(is_active) = patch.is_active {
        package.is_active = is_active;
    }

    let replace_items = patch.items.is_some();
    if let Some(items) = patch.items {
        ensure_company_inventory(state, company_id, &items).await?;
        package.items = line_items(package.id, items);
    }
    package.updated_at = Utc::now();

    let completed = timed(
        "update_package",
        state.store.update_package(&package, replace_items),
    )
    .await?;
    for _ in 0..completed {
        metrics::record_completion();
    }

    if let Some(cache) = &state.cache {
        cache.invalidate(company_id, id).await;
    }

    tracing::info!(package_id = %id, replace_items, completed, "Package updated");
    Ok(package)
}

pub async fn remove(state: &AppState, actor: &Principal, id: Uuid) -> AppResult<()> {
    let company_id = admin_scope(actor)?;
    if !timed("delete_package", state.store.delete_package(id, company_id)).await? {
        return Err(not_found());
    }

    if let Some(cache) = &state.cache {
        cache.invalidate(company_id, id).await;
    }

    tracing::info!(package_id = %id, %company_id, "Package deleted");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{CreateInventoryRequest, Role};
    use crate::services::{inventory, testing};

    pub(crate) async fn stock_item(state: &AppState, admin: &Principal, code: &str) -> Uuid {
        let request = CreateInventoryRequest {
            stock_code: code.to_string(),
            item_name: format!("Item {code}"),
            description: None,
            quantity: 100,
            unit: "unit".into(),
        };
        inventory::create(state, admin, request).await.unwrap().id
    }

    pub(crate) fn package_request(lines: &[(Uuid, i32)]) -> CreatePackageRequest {
        CreatePackageRequest {
            name: "Starter pack".into(),
            description: None,
            items: lines
                .iter()
                .map(|&(inventory_item_id, quantity)| PackageItemInput {
                    inventory_item_id,
                    quantity,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn empty_packages_are_rejected() {
        let state = testing::state();
        let acme = testing::company(&state, "Acme").await;
        let admin = testing::member(&state, Role::CompanyAdmin, Some(acme)).await;

        assert!(matches!(
            create(&state, &admin, package_request(&[])).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn foreign_inventory_cannot_be_packaged() {
        let state = testing::state();
        let acme = testing::company(&state, "Acme").await;
        let globex = testing::company(&state, "Globex").await;
        let acme_admin = testing::member(&state, Role::CompanyAdmin, Some(acme)).await;
        let globex_admin = testing::member(&state, Role::CompanyAdmin, Some(globex)).await;
        let foreign = stock_item(&state, &globex_admin, "G-1").await;

        assert!(matches!(
            create(&state, &acme_admin, package_request(&[(foreign, 1)])).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_replaces_the_whole_item_set() {
        let state = testing::state();
        let acme = testing::company(&state, "Acme").await;
        let admin = testing::member(&state, Role::CompanyAdmin, Some(acme)).await;
        let water = stock_item(&state, &admin, "WB").await;
        let soap = stock_item(&state, &admin, "SP").await;

        let package = create(&state, &admin, package_request(&[(water, 10)]))
            .await
            .unwrap();

        let patch = UpdatePackageRequest {
            items: Some(vec![PackageItemInput {
                inventory_item_id: soap,
                quantity: 2,
            }]),
            ..Default::default()
        };
        update(&state, &admin, package.id, patch).await.unwrap();

        let stored = find_one(&state, &admin, package.id).await.unwrap();
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.items[0].inventory_item_id, soap);
        assert_eq!(stored.name, "Starter pack");
    }

    #[tokio::test]
    async fn header_patch_keeps_items() {
        let state = testing::state();
        let acme = testing::company(&state, "Acme").await;
        let admin = testing::member(&state, Role::CompanyAdmin, Some(acme)).await;
        let water = stock_item(&state, &admin, "WB").await;
        let package = create(&state, &admin, package_request(&[(water, 10)]))
            .await
            .unwrap();

        let patch = UpdatePackageRequest {
            is_active: Some(false),
            ..Default::default()
        };
        let updated = update(&state, &admin, package.id, patch).await.unwrap();

        assert!(!updated.is_active);
        assert_eq!(updated.items, package.items);
    }

    #[tokio::test]
    async fn other_tenants_see_not_found() {
        let state = testing::state();
        let acme = testing::company(&state, "Acme").await;
        let globex = testing::company(&state, "Globex").await;
        let acme_admin = testing::member(&state, Role::CompanyAdmin, Some(acme)).await;
        let globex_admin = testing::member(&state, Role::CompanyAdmin, Some(globex)).await;
        let water = stock_item(&state, &acme_admin, "WB").await;
        let package = create(&state, &acme_admin, package_request(&[(water, 10)]))
            .await
            .unwrap();

        assert!(matches!(
            find_one(&state, &globex_admin, package.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            remove(&state, &globex_admin, package.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(find_one(&state, &acme_admin, package.id).await.is_ok());
    }

    #[tokio::test]
    async fn admin_without_company_is_forbidden() {
        let state = testing::state();
        let root = testing::member(&state, Role::SuperAdmin, None).await;

        assert!(matches!(
            find_all(&state, &root).await,
            Err(AppError::Forbidden(_))
        ));
    }
}
