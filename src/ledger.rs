// =============================================================================
// REDEMPTION LEDGER
// =============================================================================
// Pure accounting over the redemption event log.
//
// Nothing in here touches storage. A storage backend loads the instance, its
// package definition and every prior redemption event *inside its own
// transaction / lock*, hands them to `plan_redemption`, and persists what
// comes back. Every backend therefore shares exactly the same rules:
//
//   totalRedeemed(instance, item) = Σ quantity of matching events
//   remaining                     = allotted - totalRedeemed   (never < 0)
//   completed                     ⇔ every line item has remaining <= 0
// =============================================================================

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    AssignmentInstance, AssignmentStatus, LineProgress, PackageDefinition, PackageItem,
    RedeemItemRequest, RedemptionEvent,
};

/// Sum of redeemed quantity for one inventory item across `events`.
///
/// Summed as `i64` so a long history of `i32` quantities cannot overflow.
pub fn total_redeemed(events: &[RedemptionEvent], inventory_item_id: Uuid) -> i64 {
    events
        .iter()
        .filter(|event| event.inventory_item_id == inventory_item_id)
        .map(|event| i64::from(event.quantity))
        .sum()
}

/// Allotted minus redeemed for one line item.
pub fn remaining(line: &PackageItem, events: &[RedemptionEvent]) -> i64 {
    i64::from(line.quantity) - total_redeemed(events, line.inventory_item_id)
}

/// Progress of every line item of `package`, in definition order.
pub fn line_progress(package: &PackageDefinition, events: &[RedemptionEvent]) -> Vec<LineProgress> {
    package
        .items
        .iter()
        .map(|line| {
            let redeemed = total_redeemed(events, line.inventory_item_id);
            LineProgress {
                inventory_item_id: line.inventory_item_id,
                allotted: line.quantity,
                redeemed,
                remaining: (i64::from(line.quantity) - redeemed).max(0),
            }
        })
        .collect()
}

/// True when every line item has been redeemed up to its allotment.
pub fn is_fully_redeemed(package: &PackageDefinition, events: &[RedemptionEvent]) -> bool {
    package
        .items
        .iter()
        .all(|line| total_redeemed(events, line.inventory_item_id) >= i64::from(line.quantity))
}

// -----------------------------------------------------------------------------
// REDEMPTION PLAN
// -----------------------------------------------------------------------------

/// The writes a storage backend must apply for an accepted redemption.
#[derive(Debug, Clone)]
pub struct RedemptionPlan {
    /// Event to append
    pub event: RedemptionEvent,
    /// Remaining quantity of the redeemed item once `event` is applied
    pub remaining_after: i64,
    /// `Some(now)` when the instance must be flipped to `Completed`
    pub completed_at: Option<DateTime<Utc>>,
}

/// Validate a redemption request against the current ledger state.
///
/// `prior` must hold **all** redemption events of `instance`, loaded under
/// the same lock the caller will hold while writing the plan back.
///
/// # Errors
/// - `Validation` when `quantity < 1`
/// - `InvalidState` when the instance is not active or the quantity exceeds
///   what remains
/// - `NotFound` when the item is not part of the package
pub fn plan_redemption(
    instance: &AssignmentInstance,
    package: &PackageDefinition,
    prior: &[RedemptionEvent],
    redeemed_by: Uuid,
    request: &RedeemItemRequest,
    now: DateTime<Utc>,
) -> AppResult<RedemptionPlan> {
    if request.quantity < 1 {
        return Err(AppError::Validation("quantity must be at least 1".into()));
    }

    if instance.status != AssignmentStatus::Active {
        return Err(AppError::InvalidState(format!(
            "package is not active (status: {})",
            instance.status.as_str()
        )));
    }

    let line = package
        .line_item(request.inventory_item_id)
        .ok_or_else(|| AppError::NotFound("Item not in package".into()))?;

    let available = remaining(line, prior);
    if i64::from(request.quantity) > available {
        return Err(AppError::InvalidState(format!(
            "only {} remaining",
            available.max(0)
        )));
    }

    let event = RedemptionEvent {
        id: Uuid::new_v4(),
        user_package_id: instance.id,
        inventory_item_id: request.inventory_item_id,
        quantity: request.quantity,
        redeemed_at: now,
        redeemed_by_user_id: redeemed_by,
        notes: request.notes.clone(),
    };

    // Completion is re-derived from the whole log, not from this one line.
    let mut all_events = Vec::with_capacity(prior.len() + 1);
    all_events.extend_from_slice(prior);
    all_events.push(event.clone());
    let completed_at = is_fully_redeemed(package, &all_events).then_some(now);

    Ok(RedemptionPlan {
        remaining_after: available - i64::from(request.quantity),
        event,
        completed_at,
    })
}

/// Apply a plan to an in-memory instance (status flip only).
pub fn apply_completion(instance: &mut AssignmentInstance, plan: &RedemptionPlan) {
    if let Some(at) = plan.completed_at {
        instance.status = AssignmentStatus::Completed;
        instance.completed_at = Some(at);
    }
}

/// Re-evaluate an active instance against its package's current line items,
/// completing it at `at` when nothing remains. Used after the line-item set of
/// a package is replaced. Returns whether the status changed.
pub fn settle(
    instance: &mut AssignmentInstance,
    package: &PackageDefinition,
    events: &[RedemptionEvent],
    at: DateTime<Utc>,
) -> bool {
    if instance.status != AssignmentStatus::Active || !is_fully_redeemed(package, events) {
        return false;
    }
    instance.status = AssignmentStatus::Completed;
    instance.completed_at = Some(at);
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn package_with(lines: &[(Uuid, i32)]) -> PackageDefinition {
        let package_id = Uuid::new_v4();
        PackageDefinition {
            id: package_id,
            company_id: Uuid::new_v4(),
            name: "Test package".into(),
            description: None,
            items: lines
                .iter()
                .map(|(item, quantity)| PackageItem {
                    id: Uuid::new_v4(),
                    package_id,
                    inventory_item_id: *item,
                    quantity: *quantity,
                })
                .collect(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn instance_for(package: &PackageDefinition) -> AssignmentInstance {
        AssignmentInstance {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            package_id: package.id,
            assigned_at: Utc::now(),
            expiry_date: None,
            status: AssignmentStatus::Active,
            completed_at: None,
        }
    }

    fn request(item: Uuid, quantity: i32) -> RedeemItemRequest {
        RedeemItemRequest {
            inventory_item_id: item,
            quantity,
            notes: None,
        }
    }

    /// Plan, then record the event as committed.
    fn commit(
        instance: &mut AssignmentInstance,
        package: &PackageDefinition,
        log: &mut Vec<RedemptionEvent>,
        item: Uuid,
        quantity: i32,
    ) -> AppResult<RedemptionPlan> {
        let plan = plan_redemption(
            instance,
            package,
            log,
            instance.user_id,
            &request(item, quantity),
            Utc::now(),
        )?;
        log.push(plan.event.clone());
        apply_completion(instance, &plan);
        Ok(plan)
    }

    #[test]
    fn ten_water_bottles_scenario() {
        let bottle = Uuid::new_v4();
        let package = package_with(&[(bottle, 10)]);
        let mut instance = instance_for(&package);
        let mut log = Vec::new();

        let first = commit(&mut instance, &package, &mut log, bottle, 4).unwrap();
        assert_eq!(first.remaining_after, 6);
        assert!(first.completed_at.is_none());
        assert_eq!(instance.status, AssignmentStatus::Active);

        let second = commit(&mut instance, &package, &mut log, bottle, 6).unwrap();
        assert_eq!(second.remaining_after, 0);
        assert!(second.completed_at.is_some());
        assert_eq!(instance.status, AssignmentStatus::Completed);
        assert!(instance.completed_at.is_some());

        let third = commit(&mut instance, &package, &mut log, bottle, 1);
        match third {
            Err(AppError::InvalidState(msg)) => assert!(msg.contains("not active")),
            other => panic!("expected InvalidState, got {other:?}"),
        }
        assert_eq!(total_redeemed(&log, bottle), 10);
    }

    #[test]
    fn redeeming_one_more_than_remaining_is_rejected() {
        let item = Uuid::new_v4();
        let package = package_with(&[(item, 5)]);
        let mut instance = instance_for(&package);
        let mut log = Vec::new();
        commit(&mut instance, &package, &mut log, item, 2).unwrap();

        match commit(&mut instance, &package, &mut log, item, 4) {
            Err(AppError::InvalidState(msg)) => assert_eq!(msg, "only 3 remaining"),
            other => panic!("expected InvalidState, got {other:?}"),
        }
        // Rejected attempts leave no trace in the log.
        assert_eq!(log.len(), 1);

        let exact = commit(&mut instance, &package, &mut log, item, 3).unwrap();
        assert_eq!(exact.remaining_after, 0);
    }

    #[test]
    fn completion_requires_every_line_item() {
        let water = Uuid::new_v4();
        let cup = Uuid::new_v4();
        let package = package_with(&[(water, 2), (cup, 1)]);
        let mut instance = instance_for(&package);
        let mut log = Vec::new();

        let plan = commit(&mut instance, &package, &mut log, water, 2).unwrap();
        assert!(plan.completed_at.is_none(), "cup is still outstanding");
        assert_eq!(instance.status, AssignmentStatus::Active);

        let plan = commit(&mut instance, &package, &mut log, cup, 1).unwrap();
        assert!(plan.completed_at.is_some());
        assert!(is_fully_redeemed(&package, &log));
    }

    #[test]
    fn item_outside_package_is_not_found() {
        let package = package_with(&[(Uuid::new_v4(), 3)]);
        let instance = instance_for(&package);
        let result = plan_redemption(
            &instance,
            &package,
            &[],
            instance.user_id,
            &request(Uuid::new_v4(), 1),
            Utc::now(),
        );
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn non_active_instances_reject_regardless_of_balance() {
        let item = Uuid::new_v4();
        let package = package_with(&[(item, 100)]);
        for status in [AssignmentStatus::Completed, AssignmentStatus::Expired] {
            let mut instance = instance_for(&package);
            instance.status = status;
            let result = plan_redemption(
                &instance,
                &package,
                &[],
                instance.user_id,
                &request(item, 1),
                Utc::now(),
            );
            assert!(matches!(result, Err(AppError::InvalidState(_))), "{status:?}");
        }
    }

    #[test]
    fn zero_quantity_is_a_validation_error() {
        let item = Uuid::new_v4();
        let package = package_with(&[(item, 1)]);
        let instance = instance_for(&package);
        let result = plan_redemption(
            &instance,
            &package,
            &[],
            instance.user_id,
            &request(item, 0),
            Utc::now(),
        );
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn accepted_sequences_never_exceed_the_allotment() {
        let item = Uuid::new_v4();
        let package = package_with(&[(item, 7)]);
        let mut instance = instance_for(&package);
        let mut log = Vec::new();

        for quantity in [3, 5, 1, 2, 4, 1, 1] {
            let _ = commit(&mut instance, &package, &mut log, item, quantity);
            assert!(total_redeemed(&log, item) <= 7);
        }
        assert_eq!(total_redeemed(&log, item), 7);
        assert_eq!(instance.status, AssignmentStatus::Completed);
    }

    #[test]
    fn progress_reports_every_line() {
        let water = Uuid::new_v4();
        let cup = Uuid::new_v4();
        let package = package_with(&[(water, 10), (cup, 2)]);
        let mut instance = instance_for(&package);
        let mut log = Vec::new();
        commit(&mut instance, &package, &mut log, water, 4).unwrap();

        let progress = line_progress(&package, &log);
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].redeemed, 4);
        assert_eq!(progress[0].remaining, 6);
        assert_eq!(progress[1].redeemed, 0);
        assert_eq!(progress[1].remaining, 2);
    }

    #[test]
    fn events_for_removed_line_items_still_count_in_history_only() {
        // After a full-replace update the old item is gone from the definition;
        // its events stay in the log but no longer affect completion.
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        let package = package_with(&[(new, 1)]);
        let mut instance = instance_for(&package);
        let log = vec![RedemptionEvent {
            id: Uuid::new_v4(),
            user_package_id: instance.id,
            inventory_item_id: old,
            quantity: 3,
            redeemed_at: Utc::now(),
            redeemed_by_user_id: instance.user_id,
            notes: None,
        }];

        assert!(!is_fully_redeemed(&package, &log));
        let result = plan_redemption(
            &instance,
            &package,
            &log,
            instance.user_id,
            &request(old, 1),
            Utc::now(),
        );
        assert!(matches!(result, Err(AppError::NotFound(_))));

        let plan = plan_redemption(
            &instance,
            &package,
            &log,
            instance.user_id,
            &request(new, 1),
            Utc::now(),
        )
        .unwrap();
        apply_completion(&mut instance, &plan);
        assert_eq!(instance.status, AssignmentStatus::Completed);
    }

    #[test]
    fn shrinking_the_allotment_settles_an_active_instance() {
        let bottle = Uuid::new_v4();
        let package = package_with(&[(bottle, 10)]);
        let mut instance = instance_for(&package);
        let mut log = Vec::new();
        commit(&mut instance, &package, &mut log, bottle, 5).unwrap();

        let untouched = Utc::now();
        assert!(!settle(&mut instance, &package, &log, untouched));
        assert_eq!(instance.status, AssignmentStatus::Active);

        let mut shrunk = package.clone();
        shrunk.items[0].quantity = 5;
        let at = Utc::now();
        assert!(settle(&mut instance, &shrunk, &log, at));
        assert_eq!(instance.status, AssignmentStatus::Completed);
        assert_eq!(instance.completed_at, Some(at));

        // Already completed: nothing to do.
        assert!(!settle(&mut instance, &shrunk, &log, Utc::now()));
        assert_eq!(instance.completed_at, Some(at));
    }
}
