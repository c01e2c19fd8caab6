//! Subscription lifecycle: activation after payment, cancellation and the
//! periodic expiry sweep.

use std::time::Duration as StdDuration;

use chrono::Duration;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::entities::subscription_history::HistoryAction;
use crate::entities::subscriptions::SubscriptionStatus;
use crate::entities::{
    pinned_posts, prelude::*, subscription_history, subscription_plans, subscriptions,
};
use crate::error::{ApiError, Result};
use crate::feed::DateTime;

pub async fn active_plans<C: ConnectionTrait>(db: &C) -> Result<Vec<subscription_plans::Model>> {
    Ok(SubscriptionPlans::find()
        .filter(subscription_plans::Column::IsActive.eq(true))
        .order_by_asc(subscription_plans::Column::PriceCents)
        .order_by_asc(subscription_plans::Column::Id)
        .all(db)
        .await?)
}

pub async fn for_user<C: ConnectionTrait>(
    db: &C,
    user_id: i32,
) -> Result<Option<subscriptions::Model>> {
    Ok(Subscriptions::find()
        .filter(subscriptions::Column::UserId.eq(user_id))
        .one(db)
        .await?)
}

/// Newest entries first.
pub async fn history<C: ConnectionTrait>(
    db: &C,
    subscription_id: i32,
) -> Result<Vec<subscription_history::Model>> {
    Ok(SubscriptionHistory::find()
        .filter(subscription_history::Column::SubscriptionId.eq(subscription_id))
        .order_by_desc(subscription_history::Column::CreatedAt)
        .order_by_desc(subscription_history::Column::Id)
        .all(db)
        .await?)
}

pub async fn record<C: ConnectionTrait>(
    db: &C,
    subscription_id: i32,
    action: HistoryAction,
    description: impl Into<String>,
    metadata: Value,
    now: DateTime,
) -> std::result::Result<subscription_history::Model, DbErr> {
    subscription_history::ActiveModel {
        subscription_id: Set(subscription_id),
        action: Set(action),
        description: Set(description.into()),
        metadata: Set(metadata),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
}

/// Starts the paid period, or extends it when the subscription is still
/// effective.
pub async fn activate<C: ConnectionTrait>(
    db: &C,
    subscription: subscriptions::Model,
    plan: &subscription_plans::Model,
    payment_id: Option<i32>,
    now: DateTime,
) -> std::result::Result<subscriptions::Model, DbErr> {
    let period = Duration::days(i64::from(plan.duration_days));
    let renewing = subscription.is_effective(now);
    let sub_id = subscription.id;
    let user_id = subscription.user_id;

    let mut active = subscription.clone().into_active_model();
    if renewing {
        active.end_date = Set(subscription.end_date + period);
    } else {
        active.start_date = Set(now);
        active.end_date = Set(now + period);
    }
    active.status = Set(SubscriptionStatus::Active);
    active.plan_id = Set(plan.id);
    active.updated_at = Set(now);
    let updated = active.update(db).await?;

    let (action, description) = if renewing {
        (HistoryAction::Renewed, format!("Subscription renewed: {}", plan.name))
    } else {
        (HistoryAction::Activated, format!("Subscription activated: {}", plan.name))
    };
    record(
        db,
        sub_id,
        action,
        description,
        json!({ "plan_id": plan.id, "payment_id": payment_id, "end_date": updated.end_date }),
        now,
    )
    .await?;

    tracing::info!(user_id, subscription_id = sub_id, ?action, end_date = %updated.end_date, "subscription activated");
    Ok(updated)
}

/// Marks a subscription inactive after a failed payment. A period that is
/// already paid for stays effective; only the failure is recorded.
pub async fn payment_failed<C: ConnectionTrait>(
    db: &C,
    subscription: subscriptions::Model,
    payment_id: i32,
    reason: &str,
    now: DateTime,
) -> std::result::Result<subscriptions::Model, DbErr> {
    let sub_id = subscription.id;
    let keeps_period = subscription.is_effective(now);
    let updated = if keeps_period {
        subscription
    } else {
        let mut active = subscription.into_active_model();
        active.status = Set(SubscriptionStatus::Inactive);
        active.updated_at = Set(now);
        active.update(db).await?
    };

    record(
        db,
        sub_id,
        HistoryAction::PaymentFailed,
        format!("Payment failed: {reason}"),
        json!({ "payment_id": payment_id, "reason": reason }),
        now,
    )
    .await?;

    if keeps_period {
        tracing::info!(subscription_id = sub_id, payment_id, "failed payment left the paid period untouched");
    } else {
        tracing::info!(subscription_id = sub_id, payment_id, "subscription deactivated after failed payment");
    }
    Ok(updated)
}

/// Cancels the caller's effective subscription and releases their pin.
pub async fn cancel(
    db: &DatabaseConnection,
    user_id: i32,
    now: DateTime,
) -> Result<subscriptions::Model> {
    let txn = db.begin().await?;

    let subscription = Subscriptions::find()
        .filter(subscriptions::Column::UserId.eq(user_id))
        .lock_exclusive()
        .one(&txn)
        .await?
        .filter(|s| s.is_effective(now))
        .ok_or_else(|| ApiError::BadRequest("No active subscription to cancel".into()))?;

    let sub_id = subscription.id;
    let mut active = subscription.into_active_model();
    active.status = Set(SubscriptionStatus::Cancelled);
    active.auto_renew = Set(false);
    active.updated_at = Set(now);
    let updated = active.update(&txn).await?;

    let unpinned = PinnedPosts::delete_many()
        .filter(pinned_posts::Column::UserId.eq(user_id))
        .exec(&txn)
        .await?
        .rows_affected;

    record(
        &txn,
        sub_id,
        HistoryAction::Cancelled,
        "Subscription cancelled by user",
        json!({ "unpinned": unpinned > 0 }),
        now,
    )
    .await?;

    txn.commit().await?;
    tracing::info!(user_id, subscription_id = sub_id, "subscription cancelled");
    Ok(updated)
}

/// Marks every lapsed `active` subscription as `expired`. Pins are kept; the
/// feed stops ranking them on its own.
pub async fn expire_due(db: &DatabaseConnection, now: DateTime) -> Result<usize> {
    let candidates: Vec<i32> = Subscriptions::find()
        .filter(subscriptions::Column::Status.eq(SubscriptionStatus::Active))
        .all(db)
        .await?
        .into_iter()
        .filter(|s| s.end_date <= now)
        .map(|s| s.id)
        .collect();

    let mut expired = 0;
    for id in candidates {
        let txn = db.begin().await?;
        let current = Subscriptions::find_by_id(id)
            .lock_exclusive()
            .one(&txn)
            .await?;

        // Re-checked under the lock; a renewal may have landed meanwhile.
        let Some(subscription) = current
            .filter(|s| s.status == SubscriptionStatus::Active && s.end_date <= now)
        else {
            txn.rollback().await?;
            continue;
        };

        let end_date = subscription.end_date;
        let mut active = subscription.into_active_model();
        active.status = Set(SubscriptionStatus::Expired);
        active.updated_at = Set(now);
        active.update(&txn).await?;

        record(
            &txn,
            id,
            HistoryAction::Expired,
            "Subscription expired",
            json!({ "end_date": end_date }),
            now,
        )
        .await?;
        txn.commit().await?;
        expired += 1;
    }

    if expired > 0 {
        tracing::info!(expired, "expired lapsed subscriptions");
    }
    Ok(expired)
}

/// Runs `expire_due` every `every` on a background task.
pub fn spawn_expiry_sweep(db: DatabaseConnection, every: StdDuration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(err) = expire_due(&db, chrono::Utc::now()).await {
                tracing::error!(error = %err, "expiry sweep failed");
            }
        }
    })
}
