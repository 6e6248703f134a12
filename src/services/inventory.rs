// =============================================================================
// INVENTORY SERVICE
// =============================================================================
// Company inventory catalog. Only a CompanyAdmin manages it, and only for
// their own company.
// =============================================================================

use chrono::Utc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::models::{CreateInventoryRequest, InventoryItem, UpdateInventoryRequest};
use crate::policy;
use crate::AppState;

use super::timed;

fn admin_scope(actor: &Principal) -> AppResult<Uuid> {
    policy::can_manage_inventory(actor).into_result()?;
    policy::company_scope(actor)
}

fn not_found() -> AppError {
    AppError::NotFound("Inventory item not found".into())
}

pub async fn create(
    state: &AppState,
    actor: &Principal,
    request: CreateInventoryRequest,
) -> AppResult<InventoryItem> {
    let company_id = admin_scope(actor)?;
    request.validate()?;

    let now = Utc::now();
    let item = InventoryItem {
        id: Uuid::new_v4(),
        company_id,
        stock_code: request.stock_code,
        item_name: request.item_name,
        description: request.description,
        quantity: request.quantity,
        unit: request.unit,
        created_at: now,
        updated_at: now,
    };
    timed("insert_inventory", state.store.insert_inventory(&item)).await?;

    tracing::info!(
        item_id = %item.id,
        stock_code = %item.stock_code,
        %company_id,
        "Inventory item created"
    );
    Ok(item)
}

pub async fn find_all(state: &AppState, actor: &Principal) -> AppResult<Vec<InventoryItem>> {
    let company_id = admin_scope(actor)?;
    timed("list_inventory", state.store.list_inventory(company_id)).await
}

pub async fn find_one(state: &AppState, actor: &Principal, id: Uuid) -> AppResult<InventoryItem> {
    let company_id = admin_scope(actor)?;
    timed("get_inventory", state.store.get_inventory(id, company_id))
        .await?
        .ok_or_else(not_found)
}

pub async fn update(
    state: &AppState,
    actor: &Principal,
    id: Uuid,
    patch: UpdateInventoryRequest,
) -> AppResult<InventoryItem> {
    let company_id = admin_scope(actor)?;
    patch.validate()?;

    let mut item = timed("get_inventory", state.store.get_inventory(id, company_id))
        .await?
        .ok_or_else(not_found)?;

    if let Some(stock_code) = patch.stock_code {
        item.stock_code = stock_code;
    }
    if let Some(item_name) = patch.item_name {
        item.item_name = item_name;
    }
    if patch.description.is_some() {
        item.description = patch.description;
    }
    if let Some(quantity) = patch.quantity {
        item.quantity = quantity;
    }
    if let Some(unit) = patch.unit {
        item.unit = unit;
    }
    item.updated_at = Utc::now();

    timed("update_inventory", state.store.update_inventory(&item)).await?;
    Ok(item)
}

pub async fn remove(state: &AppState, actor: &Principal, id: Uuid) -> AppResult<()> {
    let company_id = admin_scope(actor)?;
    if !timed("delete_inventory", state.store.delete_inventory(id, company_id)).await? {
        return Err(not_found());
    }
    tracing::info!(item_id = %id, %company_id, "Inventory item deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::services::testing;

    fn water() -> CreateInventoryRequest {
        CreateInventoryRequest {
            stock_code: "WB-500".into(),
            item_name: "Water bottle 500ml".into(),
            description: None,
            quantity: 100,
            unit: "bottle".into(),
        }
    }

    #[tokio::test]
    async fn stock_codes_are_unique_per_company() {
        let state = testing::state();
        let acme = testing::company(&state, "Acme").await;
        let globex = testing::company(&state, "Globex").await;
        let acme_admin = testing::member(&state, Role::CompanyAdmin, Some(acme)).await;
        let globex_admin = testing::member(&state, Role::CompanyAdmin, Some(globex)).await;

        create(&state, &acme_admin, water()).await.unwrap();
        assert!(matches!(
            create(&state, &acme_admin, water()).await,
            Err(AppError::Conflict(_))
        ));
        // Same code in another company is fine.
        create(&state, &globex_admin, water()).await.unwrap();
    }

    #[tokio::test]
    async fn other_companies_items_are_not_found() {
        let state = testing::state();
        let acme = testing::company(&state, "Acme").await;
        let globex = testing::company(&state, "Globex").await;
        let acme_admin = testing::member(&state, Role::CompanyAdmin, Some(acme)).await;
        let globex_admin = testing::member(&state, Role::CompanyAdmin, Some(globex)).await;

        let item = create(&state, &acme_admin, water()).await.unwrap();

        assert!(matches!(
            find_one(&state, &globex_admin, item.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            remove(&state, &globex_admin, item.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn patch_applies_only_present_fields() {
        let state = testing::state();
        let acme = testing::company(&state, "Acme").await;
        let admin = testing::member(&state, Role::CompanyAdmin, Some(acme)).await;
        let item = create(&state, &admin, water()).await.unwrap();

        let patch = UpdateInventoryRequest {
            quantity: Some(40),
            ..Default::default()
        };
        let updated = update(&state, &admin, item.id, patch).await.unwrap();

        assert_eq!(updated.quantity, 40);
        assert_eq!(updated.stock_code, "WB-500");
    }

    #[tokio::test]
    async fn plain_users_cannot_manage_inventory() {
        let state = testing::state();
        let acme = testing::company(&state, "Acme").await;
        let user = testing::member(&state, Role::User, Some(acme)).await;

        assert!(matches!(
            create(&state, &user, water()).await,
            Err(AppError::Forbidden(_))
        ));
    }
}
