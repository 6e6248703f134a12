// =============================================================================
// CACHE MODULE
// =============================================================================
// Redis read-through cache for package definitions.
//
// NOTES:
// - Key: package:{companyId}:{packageId}, TTL 5 minutes
// - Only the definition is cached, never assignment or redemption state
// - Redis is optional: every failure is logged and treated as a miss
// =============================================================================

use std::time::Instant;

use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::error::AppResult;
use crate::metrics;
use crate::models::PackageDefinition;

const PACKAGE_TTL_SECS: u64 = 300;

fn package_key(company_id: Uuid, package_id: Uuid) -> String {
    format!("package:{company_id}:{package_id}")
}

#[derive(Clone)]
pub struct PackageCache {
    conn: ConnectionManager,
}

impl PackageCache {
    /// Connect to Redis. The manager reconnects on its own afterwards.
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub async fn ping(&self) -> bool {
        let start = Instant::now();
        let ok = redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn.clone())
            .await
            .is_ok();
        metrics::record_redis_operation("ping", start.elapsed().as_secs_f64());
        ok
    }

    pub async fn get(&self, company_id: Uuid, package_id: Uuid) -> Option<PackageDefinition> {
        match self.try_get(company_id, package_id).await {
            Ok(hit) => hit,
            Err(err) => {
                tracing::warn!(error = %err, %package_id, "Package cache read failed");
                None
            }
        }
    }

    pub async fn put(&self, package: &PackageDefinition) {
        if let Err(err) = self.try_put(package).await {
            tracing::warn!(error = %err, package_id = %package.id, "Package cache write failed");
        }
    }

    pub async fn invalidate(&self, company_id: Uuid, package_id: Uuid) {
        let start = Instant::now();
        let result: Result<(), _> = redis::cmd("DEL")
            .arg(package_key(company_id, package_id))
            .query_async(&mut self.conn.clone())
            .await;
        metrics::record_redis_operation("delete", start.elapsed().as_secs_f64());

        if let Err(err) = result {
            tracing::warn!(error = %err, %package_id, "Package cache invalidation failed");
        }
    }

    async fn try_get(
        &self,
        company_id: Uuid,
        package_id: Uuid,
    ) -> AppResult<Option<PackageDefinition>> {
        let start = Instant::now();
        let cached: Option<String> = redis::cmd("GET")
            .arg(package_key(company_id, package_id))
            .query_async(&mut self.conn.clone())
            .await?;
        metrics::record_redis_operation("get", start.elapsed().as_secs_f64());

        // A payload that no longer parses is treated as a miss.
        Ok(cached.and_then(|json| serde_json::from_str(&json).ok()))
    }

    async fn try_put(&self, package: &PackageDefinition) -> AppResult<()> {
        let json = serde_json::to_string(package)
            .map_err(|e| crate::error::AppError::Internal(e.to_string()))?;

        let start = Instant::now();
        redis::cmd("SETEX")
            .arg(package_key(package.company_id, package.id))
            .arg(PACKAGE_TTL_SECS)
            .arg(json)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        metrics::record_redis_operation("set", start.elapsed().as_secs_f64());
        Ok(())
    }
}
