// =============================================================================
// SERVICES MODULE
// =============================================================================
// Business operations behind the HTTP handlers. Each takes the shared
// `AppState` plus the authenticated `Principal` and returns `AppResult<T>`.
//
// Handlers stay thin: extract, call one service function, wrap the result.
// =============================================================================

use std::future::Future;
use std::time::Instant;

use crate::error::AppResult;
use crate::metrics;

pub mod assignments;
pub mod directory;
pub mod inventory;
pub mod packages;
pub mod redemption;

/// Await a storage call and record its latency under `operation`.
pub(crate) async fn timed<T, F>(operation: &'static str, call: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    let start = Instant::now();
    let result = call.await;
    metrics::record_db_query(operation, start.elapsed().as_secs_f64());
    result
}
