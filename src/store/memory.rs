//! In-memory store.
//!
//! Arena of tables keyed by id. One `RwLock` guards all of them, so every
//! method (redemption included) runs as a single critical section.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{AppError, AppResult};
use crate::ledger;
use crate::models::{
    AssignmentInstance, AssignmentRecord, AssignmentStatus, Company, InventoryItem,
    InventorySummary, PackageDefinition, RedeemItemRequest, RedemptionEvent, RedemptionOutcome,
    RedemptionView, User,
};
use crate::policy;

use super::Store;

#[derive(Debug, Default)]
struct Tables {
    companies: HashMap<Uuid, Company>,
    users: HashMap<Uuid, User>,
    inventory: HashMap<Uuid, InventoryItem>,
    packages: HashMap<Uuid, PackageDefinition>,
    assignments: HashMap<Uuid, AssignmentInstance>,
    /// Append-only, insertion order
    redemptions: Vec<RedemptionEvent>,
}

impl Tables {
    fn redemptions_of(&self, instance_id: Uuid) -> Vec<RedemptionEvent> {
        self.redemptions
            .iter()
            .filter(|event| event.user_package_id == instance_id)
            .cloned()
            .collect()
    }

    fn record(&self, instance: &AssignmentInstance) -> AppResult<AssignmentRecord> {
        let package = self
            .packages
            .get(&instance.package_id)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("package {} missing", instance.package_id)))?;
        Ok(AssignmentRecord {
            instance: instance.clone(),
            package,
            redemptions: self.redemptions_of(instance.id),
        })
    }

    /// Remove instances together with their redemption events.
    fn drop_assignments(&mut self, ids: &[Uuid]) {
        for id in ids {
            self.assignments.remove(id);
        }
        self.redemptions
            .retain(|event| !ids.contains(&event.user_package_id));
    }

    fn records<'a>(
        &self,
        instances: impl Iterator<Item = &'a AssignmentInstance>,
    ) -> AppResult<Vec<AssignmentRecord>> {
        let mut instances: Vec<&AssignmentInstance> = instances.collect();
        instances.sort_by(|a, b| b.assigned_at.cmp(&a.assigned_at));
        instances.into_iter().map(|i| self.record(i)).collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> AppResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| AppError::Internal("store lock poisoned".into()))
    }

    fn write(&self) -> AppResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| AppError::Internal("store lock poisoned".into()))
    }

    /// Force an instance status; expiry is driven from outside this service.
    #[cfg(test)]
    pub fn set_assignment_status(&self, id: Uuid, status: AssignmentStatus) {
        if let Ok(mut tables) = self.write() {
            if let Some(instance) = tables.assignments.get_mut(&id) {
                instance.status = status;
            }
        }
    }
}

fn newest_first<T>(mut rows: Vec<T>, key: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    rows.sort_by(|a, b| key(b).cmp(&key(a)));
    rows
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> bool {
        self.read().is_ok()
    }

    // -------------------------------------------------------------------------
    // COMPANIES & USERS
    // -------------------------------------------------------------------------

    async fn insert_company(&self, company: &Company) -> AppResult<()> {
        let mut tables = self.write()?;
        if tables.companies.values().any(|c| c.name == company.name) {
            return Err(AppError::Conflict("Company name already exists".into()));
        }
        tables.companies.insert(company.id, company.clone());
        Ok(())
    }

    async fn list_companies(&self) -> AppResult<Vec<Company>> {
        let tables = self.read()?;
        let rows = tables.companies.values().cloned().collect();
        Ok(newest_first(rows, |c: &Company| c.created_at))
    }

    async fn get_company(&self, id: Uuid) -> AppResult<Option<Company>> {
        Ok(self.read()?.companies.get(&id).cloned())
    }

    async fn update_company(&self, company: &Company) -> AppResult<()> {
        let mut tables = self.write()?;
        if tables
            .companies
            .values()
            .any(|c| c.id != company.id && c.name == company.name)
        {
            return Err(AppError::Conflict("Company name already exists".into()));
        }
        match tables.companies.get_mut(&company.id) {
            Some(existing) => {
                *existing = company.clone();
                Ok(())
            }
            None => Err(AppError::NotFound("Company not found".into())),
        }
    }

    async fn delete_company(&self, id: Uuid) -> AppResult<bool> {
        let mut tables = self.write()?;
        if !tables.companies.contains_key(&id) {
            return Ok(false);
        }
        if tables.users.values().any(|u| u.company_id == Some(id)) {
            return Err(AppError::Conflict("Company still has users".into()));
        }

        tables.companies.remove(&id);
        tables.inventory.retain(|_, item| item.company_id != id);
        let packages: Vec<Uuid> = tables
            .packages
            .values()
            .filter(|p| p.company_id == id)
            .map(|p| p.id)
            .collect();
        for package_id in &packages {
            tables.packages.remove(package_id);
        }
        let orphaned: Vec<Uuid> = tables
            .assignments
            .values()
            .filter(|a| packages.contains(&a.package_id))
            .map(|a| a.id)
            .collect();
        tables.drop_assignments(&orphaned);
        Ok(true)
    }

    async fn insert_user(&self, user: &User) -> AppResult<()> {
        let mut tables = self.write()?;
        if tables.users.values().any(|u| u.email == user.email) {
            return Err(AppError::Conflict("User with this email already exists".into()));
        }
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn list_users(&self, company_id: Option<Uuid>) -> AppResult<Vec<User>> {
        let tables = self.read()?;
        let rows = tables
            .users
            .values()
            .filter(|u| company_id.is_none() || u.company_id == company_id)
            .cloned()
            .collect();
        Ok(newest_first(rows, |u: &User| u.created_at))
    }

    async fn get_user(&self, id: Uuid) -> AppResult<Option<User>> {
        Ok(self.read()?.users.get(&id).cloned())
    }

    async fn users_by_ids(&self, ids: &[Uuid]) -> AppResult<Vec<User>> {
        let tables = self.read()?;
        let ids: HashSet<&Uuid> = ids.iter().collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| tables.users.get(id))
            .cloned()
            .collect())
    }

    async fn update_user(&self, user: &User) -> AppResult<()> {
        let mut tables = self.write()?;
        if tables
            .users
            .values()
            .any(|u| u.id != user.id && u.email == user.email)
        {
            return Err(AppError::Conflict("User with this email already exists".into()));
        }
        match tables.users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(AppError::NotFound("User not found".into())),
        }
    }

    async fn delete_user(&self, id: Uuid) -> AppResult<bool> {
        let mut tables = self.write()?;
        if tables.users.remove(&id).is_none() {
            return Ok(false);
        }
        let held: Vec<Uuid> = tables
            .assignments
            .values()
            .filter(|a| a.user_id == id)
            .map(|a| a.id)
            .collect();
        tables.drop_assignments(&held);
        Ok(true)
    }

    async fn count_company_users(&self, company_id: Uuid, user_ids: &[Uuid]) -> AppResult<usize> {
        let tables = self.read()?;
        let distinct: HashSet<&Uuid> = user_ids.iter().collect();
        Ok(distinct
            .into_iter()
            .filter_map(|id| tables.users.get(id))
            .filter(|u| u.company_id == Some(company_id))
            .count())
    }

    // -------------------------------------------------------------------------
    // INVENTORY
    // -------------------------------------------------------------------------

    async fn insert_inventory(&self, item: &InventoryItem) -> AppResult<()> {
        let mut tables = self.write()?;
        let clash = tables
            .inventory
            .values()
            .any(|i| i.company_id == item.company_id && i.stock_code == item.stock_code);
        if clash {
            return Err(AppError::Conflict(
                "Stock code already exists for this company".into(),
            ));
        }
        tables.inventory.insert(item.id, item.clone());
        Ok(())
    }

    async fn list_inventory(&self, company_id: Uuid) -> AppResult<Vec<InventoryItem>> {
        let tables = self.read()?;
        let rows = tables
            .inventory
            .values()
            .filter(|i| i.company_id == company_id)
            .cloned()
            .collect();
        Ok(newest_first(rows, |i: &InventoryItem| i.created_at))
    }

    async fn get_inventory(&self, id: Uuid, company_id: Uuid) -> AppResult<Option<InventoryItem>> {
        Ok(self
            .read()?
            .inventory
            .get(&id)
            .filter(|i| i.company_id == company_id)
            .cloned())
    }

    async fn update_inventory(&self, item: &InventoryItem) -> AppResult<()> {
        let mut tables = self.write()?;
        let clash = tables.inventory.values().any(|i| {
            i.id != item.id && i.company_id == item.company_id && i.stock_code == item.stock_code
        });
        if clash {
            return Err(AppError::Conflict(
                "Stock code already exists for this company".into(),
            ));
        }
        match tables.inventory.get_mut(&item.id) {
            Some(existing) if existing.company_id == item.company_id => {
                *existing = item.clone();
                Ok(())
            }
            _ => Err(AppError::NotFound("Inventory item not found".into())),
        }
    }

    async fn delete_inventory(&self, id: Uuid, company_id: Uuid) -> AppResult<bool> {
        let mut tables = self.write()?;
        let owned = tables
            .inventory
            .get(&id)
            .is_some_and(|i| i.company_id == company_id);
        if owned {
            tables.inventory.remove(&id);
        }
        Ok(owned)
    }

    async fn count_company_inventory(
        &self,
        company_id: Uuid,
        item_ids: &[Uuid],
    ) -> AppResult<usize> {
        let tables = self.read()?;
        Ok(item_ids
            .iter()
            .filter_map(|id| tables.inventory.get(id))
            .filter(|i| i.company_id == company_id)
            .count())
    }

    // -------------------------------------------------------------------------
    // PACKAGE DEFINITIONS
    // -------------------------------------------------------------------------

    async fn insert_package(&self, package: &PackageDefinition) -> AppResult<()> {
        self.write()?.packages.insert(package.id, package.clone());
        Ok(())
    }

    async fn list_packages(&self, company_id: Uuid) -> AppResult<Vec<PackageDefinition>> {
        let tables = self.read()?;
        let rows = tables
            .packages
            .values()
            .filter(|p| p.company_id == company_id)
            .cloned()
            .collect();
        Ok(newest_first(rows, |p: &PackageDefinition| p.created_at))
    }

    async fn get_package(
        &self,
        id: Uuid,
        company_id: Uuid,
    ) -> AppResult<Option<PackageDefinition>> {
        Ok(self
            .read()?
            .packages
            .get(&id)
            .filter(|p| p.company_id == company_id)
            .cloned())
    }

    async fn update_package(
        &self,
        package: &PackageDefinition,
        replace_items: bool,
    ) -> AppResult<usize> {
        let mut tables = self.write()?;
        let existing = tables
            .packages
            .get_mut(&package.id)
            .filter(|p| p.company_id == package.company_id)
            .ok_or_else(|| AppError::NotFound("Package not found".into()))?;

        let items = if replace_items {
            package.items.clone()
        } else {
            std::mem::take(&mut existing.items)
        };
        *existing = PackageDefinition {
            items,
            ..package.clone()
        };
        if !replace_items {
            return Ok(0);
        }

        let mut active: Vec<AssignmentInstance> = tables
            .assignments
            .values()
            .filter(|a| a.package_id == package.id && a.status == AssignmentStatus::Active)
            .cloned()
            .collect();
        let mut completed = 0;
        for instance in &mut active {
            let events = tables.redemptions_of(instance.id);
            if ledger::settle(instance, package, &events, package.updated_at) {
                tables.assignments.insert(instance.id, instance.clone());
                completed += 1;
            }
        }
        Ok(completed)
    }

    async fn delete_package(&self, id: Uuid, company_id: Uuid) -> AppResult<bool> {
        let mut tables = self.write()?;
        let owned = tables
            .packages
            .get(&id)
            .is_some_and(|p| p.company_id == company_id);
        if !owned {
            return Ok(false);
        }

        tables.packages.remove(&id);
        let orphaned: Vec<Uuid> = tables
            .assignments
            .values()
            .filter(|a| a.package_id == id)
            .map(|a| a.id)
            .collect();
        tables.drop_assignments(&orphaned);
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // ASSIGNMENTS
    // -------------------------------------------------------------------------

    async fn insert_assignments(&self, instances: &[AssignmentInstance]) -> AppResult<()> {
        let mut tables = self.write()?;
        for instance in instances {
            if !tables.packages.contains_key(&instance.package_id) {
                return Err(AppError::NotFound("Package not found".into()));
            }
        }
        for instance in instances {
            tables.assignments.insert(instance.id, instance.clone());
        }
        Ok(())
    }

    async fn list_package_assignments(
        &self,
        package_id: Uuid,
    ) -> AppResult<Vec<AssignmentRecord>> {
        let tables = self.read()?;
        tables.records(tables.assignments.values().filter(|a| a.package_id == package_id))
    }

    async fn list_user_assignments(&self, user_id: Uuid) -> AppResult<Vec<AssignmentRecord>> {
        let tables = self.read()?;
        tables.records(tables.assignments.values().filter(|a| a.user_id == user_id))
    }

    async fn get_assignment(&self, id: Uuid) -> AppResult<Option<AssignmentRecord>> {
        let tables = self.read()?;
        tables
            .assignments
            .get(&id)
            .map(|instance| tables.record(instance))
            .transpose()
    }

    // -------------------------------------------------------------------------
    // REDEMPTION
    // -------------------------------------------------------------------------

    async fn redeem(
        &self,
        instance_id: Uuid,
        actor: &Principal,
        request: &RedeemItemRequest,
        now: DateTime<Utc>,
    ) -> AppResult<RedemptionOutcome> {
        // Write guard held from the first read to the last write.
        let mut tables = self.write()?;

        let mut instance = tables
            .assignments
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound("User package not found".into()))?;
        policy::can_redeem(actor, &instance).into_result()?;

        let package = tables
            .packages
            .get(&instance.package_id)
            .ok_or_else(|| AppError::NotFound("Package not found".into()))?;
        let prior = tables.redemptions_of(instance_id);

        let plan = ledger::plan_redemption(&instance, package, &prior, actor.id, request, now)?;

        tables.redemptions.push(plan.event.clone());
        ledger::apply_completion(&mut instance, &plan);
        tables.assignments.insert(instance.id, instance);

        let inventory_item = tables
            .inventory
            .get(&plan.event.inventory_item_id)
            .map(InventorySummary::from);

        Ok(RedemptionOutcome {
            redemption: RedemptionView {
                event: plan.event,
                inventory_item,
            },
            remaining: plan.remaining_after,
            completed: plan.completed_at.is_some(),
        })
    }
}
