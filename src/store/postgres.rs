// =============================================================================
// POSTGRES STORE
// =============================================================================
// All PostgreSQL operations.
//
// NOTES:
// - Connection pooling via SQLx `PgPool`
// - Multi-row writes run inside a transaction
// - Redemption locks the instance row with `SELECT ... FOR UPDATE`, so two
//   concurrent redemptions against one instance are serialized
// =============================================================================

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgConnection, PgPool, Row,
};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{conflict_on_foreign_key, conflict_on_unique, AppError, AppResult};
use crate::ledger;
use crate::models::{
    AssignmentInstance, AssignmentRecord, AssignmentStatus, Company, InventoryItem,
    InventorySummary, PackageDefinition, PackageItem, PackageRow, RedeemItemRequest,
    RedemptionEvent, RedemptionOutcome, RedemptionView, Role, User,
};
use crate::policy;

use super::Store;

const USER_COLUMNS: &str =
    "id, email, first_name, last_name, role, company_id, created_at";
const INVENTORY_COLUMNS: &str =
    "id, company_id, stock_code, item_name, description, quantity, unit, created_at, updated_at";
const PACKAGE_COLUMNS: &str =
    "id, company_id, name, description, is_active, created_at, updated_at";
const ASSIGNMENT_COLUMNS: &str =
    "id, user_id, package_id, assigned_at, expiry_date, status, completed_at";
const REDEMPTION_COLUMNS: &str =
    "id, user_package_id, inventory_item_id, quantity, redeemed_at, redeemed_by_user_id, notes";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    /// Create a connection pool.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create tables and indexes if they don't exist, then seed.
    ///
    /// Every statement is idempotent, so this runs on each start.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        let statements = [
            (
                "companies",
                r#"
                CREATE TABLE IF NOT EXISTS companies (
                    id UUID PRIMARY KEY,
                    name VARCHAR(255) UNIQUE NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "users",
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id UUID PRIMARY KEY,
                    email VARCHAR(255) UNIQUE NOT NULL,
                    first_name VARCHAR(255) NOT NULL,
                    last_name VARCHAR(255) NOT NULL,
                    role VARCHAR(32) NOT NULL,
                    company_id UUID REFERENCES companies(id),
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                    CONSTRAINT valid_role CHECK (role IN ('super_admin', 'company_admin', 'user')),
                    -- SuperAdmin has no company, everyone else has one
                    CONSTRAINT role_company CHECK ((role = 'super_admin') = (company_id IS NULL))
                )
                "#,
            ),
            (
                "inventory",
                r#"
                CREATE TABLE IF NOT EXISTS inventory (
                    id UUID PRIMARY KEY,
                    company_id UUID NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                    stock_code VARCHAR(50) NOT NULL,
                    item_name VARCHAR(255) NOT NULL,
                    description TEXT,
                    quantity INTEGER NOT NULL DEFAULT 0,
                    unit VARCHAR(50) NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                    CONSTRAINT positive_quantity CHECK (quantity >= 0),
                    CONSTRAINT unique_stock_code UNIQUE (company_id, stock_code)
                )
                "#,
            ),
            (
                "packages",
                r#"
                CREATE TABLE IF NOT EXISTS packages (
                    id UUID PRIMARY KEY,
                    company_id UUID NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                    name VARCHAR(255) NOT NULL,
                    description TEXT,
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "package_items",
                r#"
                CREATE TABLE IF NOT EXISTS package_items (
                    id UUID PRIMARY KEY,
                    package_id UUID NOT NULL REFERENCES packages(id) ON DELETE CASCADE,
                    inventory_item_id UUID NOT NULL,
                    quantity INTEGER NOT NULL,
                    position INTEGER NOT NULL DEFAULT 0,

                    CONSTRAINT positive_allotment CHECK (quantity >= 1),
                    CONSTRAINT unique_line_item UNIQUE (package_id, inventory_item_id)
                )
                "#,
            ),
            (
                "user_packages",
                r#"
                CREATE TABLE IF NOT EXISTS user_packages (
                    id UUID PRIMARY KEY,
                    user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    package_id UUID NOT NULL REFERENCES packages(id) ON DELETE CASCADE,
                    assigned_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    expiry_date TIMESTAMPTZ,
                    status VARCHAR(16) NOT NULL DEFAULT 'active',
                    completed_at TIMESTAMPTZ,

                    CONSTRAINT valid_status CHECK (status IN ('active', 'completed', 'expired'))
                )
                "#,
            ),
            (
                "redemptions",
                r#"
                CREATE TABLE IF NOT EXISTS redemptions (
                    id UUID PRIMARY KEY,
                    user_package_id UUID NOT NULL REFERENCES user_packages(id) ON DELETE CASCADE,
                    -- No FK: history must survive inventory deletion
                    inventory_item_id UUID NOT NULL,
                    quantity INTEGER NOT NULL,
                    redeemed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    redeemed_by_user_id UUID NOT NULL,
                    notes TEXT,

                    CONSTRAINT positive_redemption CHECK (quantity >= 1)
                )
                "#,
            ),
            (
                "idx_user_packages_user",
                "CREATE INDEX IF NOT EXISTS idx_user_packages_user ON user_packages(user_id)",
            ),
            (
                "idx_user_packages_package",
                "CREATE INDEX IF NOT EXISTS idx_user_packages_package ON user_packages(package_id)",
            ),
            (
                "idx_redemptions_user_package",
                "CREATE INDEX IF NOT EXISTS idx_redemptions_user_package ON redemptions(user_package_id)",
            ),
            (
                "idx_inventory_company",
                "CREATE INDEX IF NOT EXISTS idx_inventory_company ON inventory(company_id)",
            ),
            (
                "idx_packages_company",
                "CREATE INDEX IF NOT EXISTS idx_packages_company ON packages(company_id)",
            ),
        ];

        for (name, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to migrate {name}"))?;
        }

        self.seed_super_admin().await?;
        Ok(())
    }

    /// Make sure one SuperAdmin user exists.
    async fn seed_super_admin(&self) -> anyhow::Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE role = 'super_admin'")
            .fetch_one(&self.pool)
            .await?;

        if count.0 > 0 {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO users (id, email, first_name, last_name, role, company_id)
            VALUES ($1, 'superadmin@waterapp.com', 'Super', 'Admin', 'super_admin', NULL)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .execute(&self.pool)
        .await?;

        tracing::info!("Seeded SuperAdmin user superadmin@waterapp.com");
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ROW MAPPING
// -----------------------------------------------------------------------------
// Users and assignments carry enum columns stored as text, so they are mapped
// by hand instead of with `FromRow`.

fn user_from_row(row: &PgRow) -> AppResult<User> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        role: role.parse::<Role>()?,
        company_id: row.try_get("company_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn assignment_from_row(row: &PgRow) -> AppResult<AssignmentInstance> {
    let status: String = row.try_get("status")?;
    Ok(AssignmentInstance {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        package_id: row.try_get("package_id")?,
        assigned_at: row.try_get("assigned_at")?,
        expiry_date: row.try_get("expiry_date")?,
        status: status.parse::<AssignmentStatus>()?,
        completed_at: row.try_get("completed_at")?,
    })
}

// -----------------------------------------------------------------------------
// SHARED LOADERS
// -----------------------------------------------------------------------------
// Take a bare connection so they work both on a pooled connection and inside
// a transaction (`&mut *tx`).

async fn load_packages(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> AppResult<HashMap<Uuid, PackageDefinition>> {
    let rows = sqlx::query_as::<_, PackageRow>(&format!(
        "SELECT {PACKAGE_COLUMNS} FROM packages WHERE id = ANY($1)"
    ))
    .bind(ids)
    .fetch_all(&mut *conn)
    .await?;

    let items = sqlx::query_as::<_, PackageItem>(
        r#"
        SELECT pi.id, pi.package_id, pi.inventory_item_id, pi.quantity
        FROM package_items pi
        WHERE pi.package_id = ANY($1)
        ORDER BY pi.package_id, pi.position
        "#,
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut items_by_package: HashMap<Uuid, Vec<PackageItem>> = HashMap::new();
    for item in items {
        items_by_package.entry(item.package_id).or_default().push(item);
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let items = items_by_package.remove(&row.id).unwrap_or_default();
            (row.id, row.with_items(items))
        })
        .collect())
}

async fn load_redemptions(
    conn: &mut PgConnection,
    instance_ids: &[Uuid],
) -> AppResult<Vec<RedemptionEvent>> {
    let events = sqlx::query_as::<_, RedemptionEvent>(&format!(
        "SELECT {REDEMPTION_COLUMNS} FROM redemptions \
         WHERE user_package_id = ANY($1) ORDER BY redeemed_at ASC, id ASC"
    ))
    .bind(instance_ids)
    .fetch_all(&mut *conn)
    .await?;
    Ok(events)
}

async fn insert_items(conn: &mut PgConnection, items: &[PackageItem]) -> AppResult<()> {
    // `position` keeps the line items in the order they were submitted.
    for (position, item) in (0_i32..).zip(items) {
        sqlx::query(
            r#"
            INSERT INTO package_items (id, package_id, inventory_item_id, quantity, position)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(item.id)
        .bind(item.package_id)
        .bind(item.inventory_item_id)
        .bind(item.quantity)
        .bind(position)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Attach package and redemption history to each instance, keeping order.
async fn hydrate(
    conn: &mut PgConnection,
    instances: Vec<AssignmentInstance>,
) -> AppResult<Vec<AssignmentRecord>> {
    if instances.is_empty() {
        return Ok(Vec::new());
    }

    let mut package_ids: Vec<Uuid> = instances.iter().map(|i| i.package_id).collect();
    package_ids.sort();
    package_ids.dedup();
    let instance_ids: Vec<Uuid> = instances.iter().map(|i| i.id).collect();

    let packages = load_packages(conn, &package_ids).await?;
    let mut events_by_instance: HashMap<Uuid, Vec<RedemptionEvent>> = HashMap::new();
    for event in load_redemptions(conn, &instance_ids).await? {
        events_by_instance
            .entry(event.user_package_id)
            .or_default()
            .push(event);
    }

    instances
        .into_iter()
        .map(|instance| -> AppResult<AssignmentRecord> {
            let package = packages.get(&instance.package_id).cloned().ok_or_else(|| {
                AppError::Internal(format!("package {} missing", instance.package_id))
            })?;
            let redemptions = events_by_instance.remove(&instance.id).unwrap_or_default();
            Ok(AssignmentRecord {
                instance,
                package,
                redemptions,
            })
        })
        .collect()
}

/// Complete every active instance of `package` that its current line items
/// leave with nothing to redeem. The instance rows are locked first, so a
/// concurrent redemption either commits before this reads its events or
/// waits and then sees the completed status.
async fn settle_instances(conn: &mut PgConnection, package: &PackageDefinition) -> AppResult<usize> {
    let rows = sqlx::query(&format!(
        "SELECT {ASSIGNMENT_COLUMNS} FROM user_packages \
         WHERE package_id = $1 AND status = $2 FOR UPDATE"
    ))
    .bind(package.id)
    .bind(AssignmentStatus::Active.as_str())
    .fetch_all(&mut *conn)
    .await?;
    let instances = rows.iter().map(assignment_from_row).collect::<AppResult<Vec<_>>>()?;
    if instances.is_empty() {
        return Ok(0);
    }

    let ids: Vec<Uuid> = instances.iter().map(|i| i.id).collect();
    let mut events_by_instance: HashMap<Uuid, Vec<RedemptionEvent>> = HashMap::new();
    for event in load_redemptions(conn, &ids).await? {
        events_by_instance
            .entry(event.user_package_id)
            .or_default()
            .push(event);
    }

    let mut completed = 0;
    for mut instance in instances {
        let events = events_by_instance.remove(&instance.id).unwrap_or_default();
        if !ledger::settle(&mut instance, package, &events, package.updated_at) {
            continue;
        }
        sqlx::query("UPDATE user_packages SET status = $2, completed_at = $3 WHERE id = $1")
            .bind(instance.id)
            .bind(instance.status.as_str())
            .bind(instance.completed_at)
            .execute(&mut *conn)
            .await?;
        completed += 1;
    }
    Ok(completed)
}

#[async_trait]
impl Store for PgStore {
    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    // -------------------------------------------------------------------------
    // COMPANIES & USERS
    // -------------------------------------------------------------------------

    async fn insert_company(&self, company: &Company) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO companies (id, name, created_at, updated_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(company.id)
        .bind(&company.name)
        .bind(company.created_at)
        .bind(company.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "Company name already exists"))?;
        Ok(())
    }

    async fn list_companies(&self) -> AppResult<Vec<Company>> {
        let rows = sqlx::query_as::<_, Company>(
            "SELECT id, name, created_at, updated_at FROM companies ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_company(&self, id: Uuid) -> AppResult<Option<Company>> {
        let row = sqlx::query_as::<_, Company>(
            "SELECT id, name, created_at, updated_at FROM companies WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_company(&self, company: &Company) -> AppResult<()> {
        let result = sqlx::query("UPDATE companies SET name = $2, updated_at = $3 WHERE id = $1")
            .bind(company.id)
            .bind(&company.name)
            .bind(company.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_on_unique(e, "Company name already exists"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Company not found".into()));
        }
        Ok(())
    }

    async fn delete_company(&self, id: Uuid) -> AppResult<bool> {
        // Users reference companies without a cascade, so a company with
        // members fails on the FK. Everything else cascades.
        let result = sqlx::query("DELETE FROM companies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_on_foreign_key(e, "Company still has users"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_user(&self, user: &User) -> AppResult<()> {
        sqlx::query(&format!(
            "INSERT INTO users ({USER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.role.as_str())
        .bind(user.company_id)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "User with this email already exists"))?;
        Ok(())
    }

    async fn list_users(&self, company_id: Option<Uuid>) -> AppResult<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE ($1::uuid IS NULL OR company_id = $1) ORDER BY created_at DESC"
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn get_user(&self, id: Uuid) -> AppResult<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn users_by_ids(&self, ids: &[Uuid]) -> AppResult<Vec<User>> {
        let rows = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ANY($1)"))
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn update_user(&self, user: &User) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET email = $2, first_name = $3, last_name = $4, role = $5, company_id = $6
            WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.role.as_str())
        .bind(user.company_id)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "User with this email already exists"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("User not found".into()));
        }
        Ok(())
    }

    async fn delete_user(&self, id: Uuid) -> AppResult<bool> {
        // FK cascades remove the user's user_packages and their redemptions.
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_company_users(&self, company_id: Uuid, user_ids: &[Uuid]) -> AppResult<usize> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM users WHERE company_id = $1 AND id = ANY($2)")
                .bind(company_id)
                .bind(user_ids)
                .fetch_one(&self.pool)
                .await?;
        Ok(usize::try_from(count.0).unwrap_or(0))
    }

    // -------------------------------------------------------------------------
    // INVENTORY
    // -------------------------------------------------------------------------

    async fn insert_inventory(&self, item: &InventoryItem) -> AppResult<()> {
        sqlx::query(&format!(
            "INSERT INTO inventory ({INVENTORY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(item.id)
        .bind(item.company_id)
        .bind(&item.stock_code)
        .bind(&item.item_name)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(&item.unit)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "Stock code already exists for this company"))?;
        Ok(())
    }

    async fn list_inventory(&self, company_id: Uuid) -> AppResult<Vec<InventoryItem>> {
        let rows = sqlx::query_as::<_, InventoryItem>(&format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory WHERE company_id = $1 ORDER BY created_at DESC"
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_inventory(&self, id: Uuid, company_id: Uuid) -> AppResult<Option<InventoryItem>> {
        let row = sqlx::query_as::<_, InventoryItem>(&format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory WHERE id = $1 AND company_id = $2"
        ))
        .bind(id)
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_inventory(&self, item: &InventoryItem) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE inventory
            SET stock_code = $3, item_name = $4, description = $5,
                quantity = $6, unit = $7, updated_at = $8
            WHERE id = $1 AND company_id = $2
            "#,
        )
        .bind(item.id)
        .bind(item.company_id)
        .bind(&item.stock_code)
        .bind(&item.item_name)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(&item.unit)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "Stock code already exists for this company"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Inventory item not found".into()));
        }
        Ok(())
    }

    async fn delete_inventory(&self, id: Uuid, company_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM inventory WHERE id = $1 AND company_id = $2")
            .bind(id)
            .bind(company_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_company_inventory(
        &self,
        company_id: Uuid,
        item_ids: &[Uuid],
    ) -> AppResult<usize> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM inventory WHERE company_id = $1 AND id = ANY($2)")
                .bind(company_id)
                .bind(item_ids)
                .fetch_one(&self.pool)
                .await?;
        Ok(usize::try_from(count.0).unwrap_or(0))
    }

    // -------------------------------------------------------------------------
    // PACKAGE DEFINITIONS
    // -------------------------------------------------------------------------

    async fn insert_package(&self, package: &PackageDefinition) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO packages ({PACKAGE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(package.id)
        .bind(package.company_id)
        .bind(&package.name)
        .bind(&package.description)
        .bind(package.is_active)
        .bind(package.created_at)
        .bind(package.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_items(&mut tx, &package.items).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_packages(&self, company_id: Uuid) -> AppResult<Vec<PackageDefinition>> {
        let mut conn = self.pool.acquire().await?;
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM packages WHERE company_id = $1 ORDER BY created_at DESC",
        )
        .bind(company_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut packages = load_packages(&mut conn, &ids).await?;
        Ok(ids.iter().filter_map(|id| packages.remove(id)).collect())
    }

    async fn get_package(
        &self,
        id: Uuid,
        company_id: Uuid,
    ) -> AppResult<Option<PackageDefinition>> {
        let mut conn = self.pool.acquire().await?;
        let package = load_packages(&mut conn, &[id]).await?.remove(&id);
        Ok(package.filter(|p| p.company_id == company_id))
    }

    async fn update_package(
        &self,
        package: &PackageDefinition,
        replace_items: bool,
    ) -> AppResult<usize> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE packages
            SET name = $3, description = $4, is_active = $5, updated_at = $6
            WHERE id = $1 AND company_id = $2
            "#,
        )
        .bind(package.id)
        .bind(package.company_id)
        .bind(&package.name)
        .bind(&package.description)
        .bind(package.is_active)
        .bind(package.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Package not found".into()));
        }

        if replace_items {
            // Full replace, never a merge.
            sqlx::query("DELETE FROM package_items WHERE package_id = $1")
                .bind(package.id)
                .execute(&mut *tx)
                .await?;
            insert_items(&mut tx, &package.items).await?;
        }
        let completed = if replace_items {
            settle_instances(&mut tx, package).await?
        } else {
            0
        };

        tx.commit().await?;
        Ok(completed)
    }

    async fn delete_package(&self, id: Uuid, company_id: Uuid) -> AppResult<bool> {
        // FK cascades remove line items, user_packages and their redemptions.
        let result = sqlx::query("DELETE FROM packages WHERE id = $1 AND company_id = $2")
            .bind(id)
            .bind(company_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // ASSIGNMENTS
    // -------------------------------------------------------------------------

    async fn insert_assignments(&self, instances: &[AssignmentInstance]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        for instance in instances {
            sqlx::query(&format!(
                "INSERT INTO user_packages ({ASSIGNMENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
            ))
            .bind(instance.id)
            .bind(instance.user_id)
            .bind(instance.package_id)
            .bind(instance.assigned_at)
            .bind(instance.expiry_date)
            .bind(instance.status.as_str())
            .bind(instance.completed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_package_assignments(
        &self,
        package_id: Uuid,
    ) -> AppResult<Vec<AssignmentRecord>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM user_packages \
             WHERE package_id = $1 ORDER BY assigned_at DESC"
        ))
        .bind(package_id)
        .fetch_all(&mut *conn)
        .await?;

        let instances = rows.iter().map(assignment_from_row).collect::<AppResult<Vec<_>>>()?;
        hydrate(&mut conn, instances).await
    }

    async fn list_user_assignments(&self, user_id: Uuid) -> AppResult<Vec<AssignmentRecord>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM user_packages \
             WHERE user_id = $1 ORDER BY assigned_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;

        let instances = rows.iter().map(assignment_from_row).collect::<AppResult<Vec<_>>>()?;
        hydrate(&mut conn, instances).await
    }

    async fn get_assignment(&self, id: Uuid) -> AppResult<Option<AssignmentRecord>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM user_packages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let instance = assignment_from_row(&row)?;
        Ok(hydrate(&mut conn, vec![instance]).await?.pop())
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
        let mut tx = self.pool.begin().await?;

        // Row lock: a concurrent redemption on this instance waits here until
        // we commit, then sees our event in its own sum.
        let row = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM user_packages WHERE id = $1 FOR UPDATE"
        ))
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound("User package not found".into()))?;
        let instance = assignment_from_row(&row)?;
        policy::can_redeem(actor, &instance).into_result()?;

        let package = load_packages(&mut tx, &[instance.package_id])
            .await?
            .remove(&instance.package_id)
            .ok_or_else(|| AppError::NotFound("Package not found".into()))?;
        let prior = load_redemptions(&mut tx, &[instance.id]).await?;

        let plan = ledger::plan_redemption(&instance, &package, &prior, actor.id, request, now)?;
        let event = &plan.event;

        sqlx::query(&format!(
            "INSERT INTO redemptions ({REDEMPTION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(event.id)
        .bind(event.user_package_id)
        .bind(event.inventory_item_id)
        .bind(event.quantity)
        .bind(event.redeemed_at)
        .bind(event.redeemed_by_user_id)
        .bind(&event.notes)
        .execute(&mut *tx)
        .await?;

        if let Some(completed_at) = plan.completed_at {
            sqlx::query(
                "UPDATE user_packages SET status = $2, completed_at = $3 WHERE id = $1",
            )
            .bind(instance.id)
            .bind(AssignmentStatus::Completed.as_str())
            .bind(completed_at)
            .execute(&mut *tx)
            .await?;
        }

        let inventory_item = sqlx::query_as::<_, InventorySummary>(
            "SELECT id, stock_code, item_name, unit FROM inventory WHERE id = $1",
        )
        .bind(event.inventory_item_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RedemptionOutcome {
            remaining: plan.remaining_after,
            completed: plan.completed_at.is_some(),
            redemption: RedemptionView {
                event: plan.event,
                inventory_item,
            },
        })
    }
}

// Run against a disposable database:
//   DATABASE_URL=postgres://... cargo test -- --ignored
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgStore::connect(&url).await.unwrap();
        store.run_migrations().await.unwrap();
        store
    }

    /// A company, one user in it and a single-line package assigned to them.
    async fn assigned(store: &PgStore, quantity: i32) -> (Principal, Uuid, Uuid) {
        let now = Utc::now();
        let company = Company {
            id: Uuid::new_v4(),
            name: format!("Row lock {}", Uuid::new_v4()),
            created_at: now,
            updated_at: now,
        };
        store.insert_company(&company).await.unwrap();

        let user = User {
            id: Uuid::new_v4(),
            email: format!("{}@example.com", Uuid::new_v4()),
            first_name: "Row".into(),
            last_name: "Lock".into(),
            role: Role::User,
            company_id: Some(company.id),
            created_at: now,
        };
        store.insert_user(&user).await.unwrap();

        let item = Uuid::new_v4();
        let package_id = Uuid::new_v4();
        let package = PackageDefinition {
            id: package_id,
            company_id: company.id,
            name: "Water".into(),
            description: None,
            items: vec![PackageItem {
                id: Uuid::new_v4(),
                package_id,
                inventory_item_id: item,
                quantity,
            }],
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        store.insert_package(&package).await.unwrap();

        let instance = AssignmentInstance {
            id: Uuid::new_v4(),
            user_id: user.id,
            package_id,
            assigned_at: now,
            expiry_date: None,
            status: AssignmentStatus::Active,
            completed_at: None,
        };
        store.insert_assignments(&[instance.clone()]).await.unwrap();

        let principal = Principal {
            id: user.id,
            email: user.email,
            role: Role::User,
            company_id: Some(company.id),
        };
        (principal, instance.id, item)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore = "needs a PostgreSQL database in DATABASE_URL"]
    async fn row_lock_serializes_concurrent_redemptions() {
        let store = Arc::new(store().await);
        let (user, instance_id, item) = assigned(&store, 10).await;

        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = Arc::clone(&store);
            let user = user.clone();
            handles.push(tokio::spawn(async move {
                let request = RedeemItemRequest {
                    inventory_item_id: item,
                    quantity: 6,
                    notes: None,
                };
                store.redeem(instance_id, &user, &request, Utc::now()).await
            }));
        }

        let mut accepted = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(AppError::InvalidState(_)) => rejected += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!((accepted, rejected), (1, 1));

        let record = store.get_assignment(instance_id).await.unwrap().unwrap();
        assert_eq!(ledger::total_redeemed(&record.redemptions, item), 6);
        assert_eq!(record.instance.status, AssignmentStatus::Active);
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL database in DATABASE_URL"]
    async fn replacing_items_settles_instances_in_the_same_transaction() {
        let store = store().await;
        let (user, instance_id, item) = assigned(&store, 10).await;
        let request = RedeemItemRequest {
            inventory_item_id: item,
            quantity: 5,
            notes: None,
        };
        store.redeem(instance_id, &user, &request, Utc::now()).await.unwrap();

        let mut package = store.get_assignment(instance_id).await.unwrap().unwrap().package;
        package.items[0].id = Uuid::new_v4();
        package.items[0].quantity = 5;
        package.updated_at = Utc::now();
        assert_eq!(store.update_package(&package, true).await.unwrap(), 1);

        let record = store.get_assignment(instance_id).await.unwrap().unwrap();
        assert_eq!(record.instance.status, AssignmentStatus::Completed);
        assert!(record.instance.completed_at.is_some());
    }
}
