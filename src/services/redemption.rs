// =============================================================================
// REDEMPTION ENGINE
// =============================================================================
// Redeem a quantity of one item from an assigned package.
//
// The store does the locking and the writes; the accounting rules live in
// `ledger::plan_redemption`. This layer adds the request context: span,
// structured log events and ledger metrics.
// =============================================================================

use chrono::Utc;
use tracing::Instrument;
use uuid::Uuid;

use crate::auth::{CorrelationId, Principal};
use crate::error::AppResult;
use crate::metrics;
use crate::models::{RedeemItemRequest, RedemptionView};
use crate::AppState;

use super::timed;

pub async fn redeem(
    state: &AppState,
    actor: &Principal,
    instance_id: Uuid,
    request: RedeemItemRequest,
    correlation_id: CorrelationId,
) -> AppResult<RedemptionView> {
    let span = tracing::info_span!(
        "redeem",
        %correlation_id,
        user_package_id = %instance_id,
        inventory_item_id = %request.inventory_item_id,
        quantity = request.quantity,
    );

    async move {
        let result = timed(
            "redeem",
            state.store.redeem(instance_id, actor, &request, Utc::now()),
        )
        .await;

        match result {
            Ok(outcome) => {
                metrics::record_redemption(true, request.quantity);
                tracing::info!(
                    redemption_id = %outcome.redemption.event.id,
                    remaining = outcome.remaining,
                    "Item redeemed"
                );

                if outcome.completed {
                    metrics::record_completion();
                    tracing::info!("Package completed");
                }
                Ok(outcome.redemption)
            }
            Err(err) => {
                metrics::record_redemption(false, 0);
                tracing::warn!(error = %err, "Redemption rejected");
                Err(err)
            }
        }
    }
    .instrument(span)
    .await
}
