// =============================================================================
// STORAGE MODULE
// =============================================================================
// `Store` is the keyed persistence used by every service. Two backends:
//
// - `PgStore`     PostgreSQL via SQLx (production)
// - `MemoryStore` arena of HashMaps behind one lock (local runs and tests)
//
// Methods that must be atomic (`insert_package`, `update_package`,
// `insert_assignments`, `redeem`) are atomic in every backend.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::AppResult;
use crate::models::{
    AssignmentInstance, AssignmentRecord, Company, InventoryItem, PackageDefinition,
    RedeemItemRequest, RedemptionOutcome, User,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Whether the backend can serve queries right now.
    async fn health_check(&self) -> bool;

    // -------------------------------------------------------------------------
    // COMPANIES & USERS
    // -------------------------------------------------------------------------

    /// `Conflict` when the name is taken.
    async fn insert_company(&self, company: &Company) -> AppResult<()>;
    async fn list_companies(&self) -> AppResult<Vec<Company>>;
    async fn get_company(&self, id: Uuid) -> AppResult<Option<Company>>;
    /// Overwrite an existing row. `Conflict` when the name is taken.
    async fn update_company(&self, company: &Company) -> AppResult<()>;
    /// Cascades inventory, packages, instances and redemptions. `Conflict`
    /// while the company still has users.
    async fn delete_company(&self, id: Uuid) -> AppResult<bool>;

    /// `Conflict` when the email is taken.
    async fn insert_user(&self, user: &User) -> AppResult<()>;
    /// Newest first. `None` lists every company.
    async fn list_users(&self, company_id: Option<Uuid>) -> AppResult<Vec<User>>;
    async fn get_user(&self, id: Uuid) -> AppResult<Option<User>>;
    /// The users among `ids` that exist, in no particular order.
    async fn users_by_ids(&self, ids: &[Uuid]) -> AppResult<Vec<User>>;
    /// Overwrite an existing row. `Conflict` when the email is taken.
    async fn update_user(&self, user: &User) -> AppResult<()>;
    /// Cascades the user's instances and their redemptions.
    async fn delete_user(&self, id: Uuid) -> AppResult<bool>;
    /// How many distinct ids among `user_ids` are users of `company_id`.
    async fn count_company_users(&self, company_id: Uuid, user_ids: &[Uuid]) -> AppResult<usize>;

    // -------------------------------------------------------------------------
    // INVENTORY
    // -------------------------------------------------------------------------

    /// `Conflict` when the stock code is taken within the company.
    async fn insert_inventory(&self, item: &InventoryItem) -> AppResult<()>;
    /// Newest first.
    async fn list_inventory(&self, company_id: Uuid) -> AppResult<Vec<InventoryItem>>;
    async fn get_inventory(&self, id: Uuid, company_id: Uuid) -> AppResult<Option<InventoryItem>>;
    /// Overwrite an existing row. `Conflict` on a stock code clash.
    async fn update_inventory(&self, item: &InventoryItem) -> AppResult<()>;
    /// `false` when nothing matched.
    async fn delete_inventory(&self, id: Uuid, company_id: Uuid) -> AppResult<bool>;
    /// How many of `item_ids` are inventory items of `company_id`.
    async fn count_company_inventory(&self, company_id: Uuid, item_ids: &[Uuid])
        -> AppResult<usize>;

    // -------------------------------------------------------------------------
    // PACKAGE DEFINITIONS
    // -------------------------------------------------------------------------

    /// Header and line items in one unit.
    async fn insert_package(&self, package: &PackageDefinition) -> AppResult<()>;
    /// Newest first.
    async fn list_packages(&self, company_id: Uuid) -> AppResult<Vec<PackageDefinition>>;
    async fn get_package(&self, id: Uuid, company_id: Uuid)
        -> AppResult<Option<PackageDefinition>>;
    /// Overwrite the header; with `replace_items` the stored line-item set is
    /// deleted and replaced by `package.items` in the same unit, and every
    /// active instance the new set leaves fully redeemed is completed at
    /// `package.updated_at`. Returns how many instances were completed.
    async fn update_package(&self, package: &PackageDefinition, replace_items: bool)
        -> AppResult<usize>;
    /// Cascades line items, assignment instances and their redemptions.
    async fn delete_package(&self, id: Uuid, company_id: Uuid) -> AppResult<bool>;

    // -------------------------------------------------------------------------
    // ASSIGNMENTS
    // -------------------------------------------------------------------------

    /// All instances or none.
    async fn insert_assignments(&self, instances: &[AssignmentInstance]) -> AppResult<()>;
    /// Most recently assigned first.
    async fn list_package_assignments(&self, package_id: Uuid) -> AppResult<Vec<AssignmentRecord>>;
    /// Most recently assigned first.
    async fn list_user_assignments(&self, user_id: Uuid) -> AppResult<Vec<AssignmentRecord>>;
    async fn get_assignment(&self, id: Uuid) -> AppResult<Option<AssignmentRecord>>;

    // -------------------------------------------------------------------------
    // REDEMPTION
    // -------------------------------------------------------------------------

    /// Lock the instance, check `policy::can_redeem`, plan with
    /// `ledger::plan_redemption` against every prior event, then append the
    /// event and flip the status, all before releasing the lock.
    async fn redeem(
        &self,
        instance_id: Uuid,
        actor: &Principal,
        request: &RedeemItemRequest,
        now: DateTime<Utc>,
    ) -> AppResult<RedemptionOutcome>;
}
