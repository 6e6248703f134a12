// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures used throughout the service.
//
// NOTES:
// - Entities are stored arena-style: every relation is an explicit `Uuid`
//   foreign key, never an owned object graph
// - JSON uses camelCase field names
// - Request structs carry their own `validate()`
// =============================================================================

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

// =============================================================================
// ROLES
// =============================================================================
/// Role carried in the bearer token and stored on users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    CompanyAdmin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::CompanyAdmin => "company_admin",
            Role::User => "user",
        }
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "super_admin" => Ok(Role::SuperAdmin),
            "company_admin" => Ok(Role::CompanyAdmin),
            "user" => Ok(Role::User),
            other => Err(AppError::Internal(format!("unknown role: {other}"))),
        }
    }
}

// =============================================================================
// COMPANY & USER
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    /// Always stored lower-case
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    /// `None` only for super admins
    pub company_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// INVENTORY ITEM
// =============================================================================
// A company-scoped stock item. The redemption ledger only reads these.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: Uuid,
    pub company_id: Uuid,

    /// Unique within the owning company, e.g. "WATER-500ML"
    pub stock_code: String,

    pub item_name: String,
    pub description: Option<String>,

    /// Quantity on hand (informational)
    pub quantity: i32,

    /// Unit of measurement, e.g. "bottles"
    pub unit: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Display subset of an inventory item attached to redemption events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct InventorySummary {
    pub id: Uuid,
    pub stock_code: String,
    pub item_name: String,
    pub unit: String,
}

impl From<&InventoryItem> for InventorySummary {
    fn from(item: &InventoryItem) -> Self {
        Self {
            id: item.id,
            stock_code: item.stock_code.clone(),
            item_name: item.item_name.clone(),
            unit: item.unit.clone(),
        }
    }
}

// =============================================================================
// PACKAGE DEFINITION
// =============================================================================

/// One `(inventory item, quantity)` line of a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PackageItem {
    pub id: Uuid,
    pub package_id: Uuid,
    pub inventory_item_id: Uuid,
    /// Allotted quantity, always >= 1
    pub quantity: i32,
}

/// A company-owned bundle of line items that can be assigned to users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageDefinition {
    pub id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub items: Vec<PackageItem>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PackageDefinition {
    /// Line item for an inventory item, if the package contains it.
    pub fn line_item(&self, inventory_item_id: Uuid) -> Option<&PackageItem> {
        self.items
            .iter()
            .find(|item| item.inventory_item_id == inventory_item_id)
    }
}

/// Package header row; items are loaded separately.
#[derive(Debug, Clone, FromRow)]
pub struct PackageRow {
    pub id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PackageRow {
    pub fn with_items(self, items: Vec<PackageItem>) -> PackageDefinition {
        PackageDefinition {
            id: self.id,
            company_id: self.company_id,
            name: self.name,
            description: self.description,
            items,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

// =============================================================================
// ASSIGNMENT INSTANCE ("user package")
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Completed,
    Expired,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Active => "active",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Expired => "expired",
        }
    }
}

impl FromStr for AssignmentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AssignmentStatus::Active),
            "completed" => Ok(AssignmentStatus::Completed),
            "expired" => Ok(AssignmentStatus::Expired),
            other => Err(AppError::Internal(format!("unknown assignment status: {other}"))),
        }
    }
}

/// One grant of a package to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentInstance {
    pub id: Uuid,
    pub user_id: Uuid,
    pub package_id: Uuid,
    pub assigned_at: DateTime<Utc>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub status: AssignmentStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// REDEMPTION EVENT
// =============================================================================
// Immutable once written. Remaining quantities are always derived from the
// full list of these, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionEvent {
    pub id: Uuid,
    pub user_package_id: Uuid,
    pub inventory_item_id: Uuid,
    pub quantity: i32,
    pub redeemed_at: DateTime<Utc>,
    pub redeemed_by_user_id: Uuid,
    pub notes: Option<String>,
}

/// Redemption event with its inventory item resolved for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionView {
    #[serde(flatten)]
    pub event: RedemptionEvent,
    pub inventory_item: Option<InventorySummary>,
}

/// What a committed redemption produced.
#[derive(Debug, Clone)]
pub struct RedemptionOutcome {
    pub redemption: RedemptionView,
    /// Remaining quantity of the redeemed item after this event
    pub remaining: i64,
    /// Whether this redemption flipped the instance to `Completed`
    pub completed: bool,
}

// =============================================================================
// DERIVED READ MODELS
// =============================================================================

/// Per-line-item progress of an assignment instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineProgress {
    pub inventory_item_id: Uuid,
    pub allotted: i32,
    pub redeemed: i64,
    pub remaining: i64,
}

/// Instance plus everything needed to show it, as loaded by the store.
#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub instance: AssignmentInstance,
    pub package: PackageDefinition,
    /// Oldest first
    pub redemptions: Vec<RedemptionEvent>,
}

/// Who holds an instance, as shown to the package's admins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
        }
    }
}

/// API view of an assignment instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentDetail {
    #[serde(flatten)]
    pub instance: AssignmentInstance,
    /// Only filled in on the per-package listing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
    pub package: PackageDefinition,
    pub redemptions: Vec<RedemptionEvent>,
    pub progress: Vec<LineProgress>,
}

impl From<AssignmentRecord> for AssignmentDetail {
    fn from(record: AssignmentRecord) -> Self {
        let progress = crate::ledger::line_progress(&record.package, &record.redemptions);
        Self {
            instance: record.instance,
            user: None,
            package: record.package,
            redemptions: record.redemptions,
            progress,
        }
    }
}

// =============================================================================
// API REQUEST STRUCTURES
// =============================================================================

// -----------------------------------------------------------------------------
// COMPANIES & USERS
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCompanyRequest {
    pub name: String,
}

impl CreateCompanyRequest {
    pub fn validate(&self) -> AppResult<()> {
        require_text("name", &self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    /// Defaults to `user`
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub company_id: Option<Uuid>,
}

impl CreateUserRequest {
    pub fn role(&self) -> Role {
        self.role.unwrap_or(Role::User)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !self.email.contains('@') {
            return Err(AppError::Validation("email must be a valid address".into()));
        }
        require_text("firstName", &self.first_name)?;
        require_text("lastName", &self.last_name)?;
        validate_role_company(self.role(), self.company_id)
    }
}

/// SuperAdmin has no company; everyone else has exactly one.
pub fn validate_role_company(role: Role, company_id: Option<Uuid>) -> AppResult<()> {
    match (role, company_id) {
        (Role::SuperAdmin, Some(_)) => Err(AppError::Validation(
            "SuperAdmin cannot be assigned to a company".into(),
        )),
        (Role::CompanyAdmin | Role::User, None) => Err(AppError::Validation(
            "CompanyAdmin and User must be assigned to a company".into(),
        )),
        _ => Ok(()),
    }
}

/// Partial update. The merged result must still pass `validate_role_company`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<Role>,
    pub company_id: Option<Uuid>,
}

impl UpdateUserRequest {
    pub fn validate(&self) -> AppResult<()> {
        if matches!(&self.email, Some(email) if !email.contains('@')) {
            return Err(AppError::Validation("email must be a valid address".into()));
        }
        if let Some(first_name) = &self.first_name {
            require_text("firstName", first_name)?;
        }
        if let Some(last_name) = &self.last_name {
            require_text("lastName", last_name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCompanyRequest {
    pub name: Option<String>,
}

impl UpdateCompanyRequest {
    pub fn validate(&self) -> AppResult<()> {
        match &self.name {
            Some(name) => require_text("name", name),
            None => Ok(()),
        }
    }
}

// -----------------------------------------------------------------------------
// INVENTORY
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInventoryRequest {
    pub stock_code: String,
    pub item_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub quantity: i32,
    pub unit: String,
}

impl CreateInventoryRequest {
    pub fn validate(&self) -> AppResult<()> {
        require_text("stockCode", &self.stock_code)?;
        require_text("itemName", &self.item_name)?;
        require_text("unit", &self.unit)?;
        if self.quantity < 0 {
            return Err(AppError::Validation("quantity must be >= 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInventoryRequest {
    pub stock_code: Option<String>,
    pub item_name: Option<String>,
    pub description: Option<String>,
    pub quantity: Option<i32>,
    pub unit: Option<String>,
}

impl UpdateInventoryRequest {
    pub fn validate(&self) -> AppResult<()> {
        if let Some(code) = &self.stock_code {
            require_text("stockCode", code)?;
        }
        if let Some(name) = &self.item_name {
            require_text("itemName", name)?;
        }
        if let Some(unit) = &self.unit {
            require_text("unit", unit)?;
        }
        if matches!(self.quantity, Some(q) if q < 0) {
            return Err(AppError::Validation("quantity must be >= 0".into()));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// PACKAGES
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageItemInput {
    pub inventory_item_id: Uuid,
    pub quantity: i32,
}

/// # Example JSON
/// ```json
/// {
///   "name": "10 Water Bottles",
///   "items": [{ "inventoryItemId": "…", "quantity": 10 }]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePackageRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub items: Vec<PackageItemInput>,
}

impl CreatePackageRequest {
    pub fn validate(&self) -> AppResult<()> {
        require_text("name", &self.name)?;
        validate_line_items(&self.items)
    }
}

/// Partial update. `items`, when present, replaces the whole line-item set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePackageRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub items: Option<Vec<PackageItemInput>>,
}

impl UpdatePackageRequest {
    pub fn validate(&self) -> AppResult<()> {
        if let Some(name) = &self.name {
            require_text("name", name)?;
        }
        if let Some(items) = &self.items {
            validate_line_items(items)?;
        }
        Ok(())
    }
}

fn validate_line_items(items: &[PackageItemInput]) -> AppResult<()> {
    if items.is_empty() {
        return Err(AppError::Validation(
            "package must contain at least one item".into(),
        ));
    }

    let mut seen = HashSet::new();
    for item in items {
        if item.quantity < 1 {
            return Err(AppError::Validation(format!(
                "quantity for item {} must be at least 1",
                item.inventory_item_id
            )));
        }
        if !seen.insert(item.inventory_item_id) {
            return Err(AppError::Validation(format!(
                "item {} is listed more than once",
                item.inventory_item_id
            )));
        }
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// ASSIGNMENT
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignPackageRequest {
    pub user_ids: Vec<Uuid>,
    #[serde(default)]
    pub expiry_date: Option<DateTime<Utc>>,
}

impl AssignPackageRequest {
    pub fn validate(&self) -> AppResult<()> {
        if self.user_ids.is_empty() {
            return Err(AppError::Validation("userIds must not be empty".into()));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// REDEMPTION
// -----------------------------------------------------------------------------
/// # Example JSON
/// ```json
/// { "inventoryItemId": "…", "quantity": 4, "notes": "front desk" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemItemRequest {
    pub inventory_item_id: Uuid,
    #[serde(default = "default_redeem_quantity")]
    pub quantity: i32,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_redeem_quantity() -> i32 {
    1
}

fn require_text(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub storage: bool,
    /// `None` when no cache is configured
    pub cache: Option<bool>,
}

// =============================================================================
// GENERIC RESPONSES
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }
}
