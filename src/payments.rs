//! Gateway-free payments for subscription plans.
//!
//! A checkout creates a pending payment; a provider (or an operator) later
//! reports the outcome through the webhook, which is idempotent on the
//! event id.

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde_json::json;

use crate::entities::payments::PaymentStatus;
use crate::entities::subscription_history::HistoryAction;
use crate::entities::subscriptions::SubscriptionStatus;
use crate::entities::webhook_events::WebhookStatus;
use crate::entities::{
    payments, prelude::*, subscription_plans, subscriptions, users, webhook_events,
};
use crate::error::{is_unique_violation, ApiError, Result};
use crate::feed::DateTime;
use crate::models::WebhookPayload;
use crate::subscriptions as subs;

pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
pub const PAYMENT_FAILED: &str = "payment.failed";
pub const PROVIDER: &str = "manual";

/// What the webhook did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Ignored,
    Duplicate,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Duplicate => "duplicate",
        }
    }
}

async fn insert_payment(
    txn: &DatabaseTransaction,
    user_id: i32,
    subscription_id: i32,
    plan: &subscription_plans::Model,
    currency: &str,
    now: DateTime,
) -> Result<payments::Model> {
    Ok(payments::ActiveModel {
        user_id: Set(user_id),
        subscription_id: Set(Some(subscription_id)),
        amount_cents: Set(plan.price_cents),
        currency: Set(currency.to_string()),
        status: Set(PaymentStatus::Pending),
        payment_method: Set(PROVIDER.to_string()),
        description: Set(format!("Subscription to {}", plan.name)),
        metadata: Set(json!({ "plan_id": plan.id, "plan_name": plan.name })),
        created_at: Set(now),
        updated_at: Set(now),
        processed_at: Set(None),
        ..Default::default()
    }
    .insert(txn)
    .await?)
}

/// Opens a pending payment for `plan_id`, creating or resetting the
/// caller's subscription to `pending`.
pub async fn checkout(
    db: &DatabaseConnection,
    user: &users::Model,
    plan_id: i32,
    currency: &str,
    now: DateTime,
) -> Result<(payments::Model, subscriptions::Model)> {
    let plan = SubscriptionPlans::find_by_id(plan_id)
        .one(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Subscription plan"))?;
    if !plan.is_active {
        return Err(ApiError::field("plan_id", "Selected plan is not active."));
    }

    let txn = db.begin().await?;
    let existing = subs::for_user(&txn, user.id).await?;
    if existing.as_ref().is_some_and(|s| s.is_effective(now)) {
        return Err(ApiError::BadRequest(
            "User already has an active subscription.".into(),
        ));
    }

    let subscription = match existing {
        Some(current) => {
            let mut active = current.into_active_model();
            active.plan_id = Set(plan.id);
            active.status = Set(SubscriptionStatus::Pending);
            active.auto_renew = Set(true);
            active.updated_at = Set(now);
            active.update(&txn).await?
        }
        None => {
            subscriptions::ActiveModel {
                user_id: Set(user.id),
                plan_id: Set(plan.id),
                status: Set(SubscriptionStatus::Pending),
                start_date: Set(now),
                end_date: Set(now),
                auto_renew: Set(true),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .insert(&txn)
            .await?
        }
    };

    subs::record(
        &txn,
        subscription.id,
        HistoryAction::Created,
        format!("Subscription created for plan {}", plan.name),
        json!({ "plan_id": plan.id }),
        now,
    )
    .await?;
    let payment = insert_payment(&txn, user.id, subscription.id, &plan, currency, now).await?;
    txn.commit().await?;

    tracing::info!(user_id = user.id, payment_id = payment.id, plan = %plan.name, "checkout opened");
    Ok((payment, subscription))
}

/// The caller's payments, newest first.
pub async fn list(db: &DatabaseConnection, user_id: i32) -> Result<Vec<payments::Model>> {
    Ok(Payments::find()
        .filter(payments::Column::UserId.eq(user_id))
        .order_by_desc(payments::Column::CreatedAt)
        .order_by_desc(payments::Column::Id)
        .all(db)
        .await?)
}

/// One of the caller's payments; other users' payments are not found.
pub async fn get(db: &DatabaseConnection, user_id: i32, payment_id: i32) -> Result<payments::Model> {
    Payments::find_by_id(payment_id)
        .filter(payments::Column::UserId.eq(user_id))
        .one(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Payment"))
}

pub async fn cancel(
    db: &DatabaseConnection,
    user_id: i32,
    payment_id: i32,
    now: DateTime,
) -> Result<payments::Model> {
    let payment = get(db, user_id, payment_id).await?;
    if !payment.status.is_pending() {
        return Err(ApiError::BadRequest("Only pending payments can be cancelled".into()));
    }

    let mut active = payment.into_active_model();
    active.status = Set(PaymentStatus::Cancelled);
    active.updated_at = Set(now);
    let payment = active.update(db).await?;

    tracing::info!(user_id, payment_id, "payment cancelled");
    Ok(payment)
}

/// Opens a fresh pending payment for the subscription of a failed one.
pub async fn retry(
    db: &DatabaseConnection,
    user_id: i32,
    payment_id: i32,
    currency: &str,
    now: DateTime,
) -> Result<payments::Model> {
    let failed = get(db, user_id, payment_id).await?;
    if failed.status != PaymentStatus::Failed {
        return Err(ApiError::BadRequest("Only failed payments can be retried".into()));
    }
    let subscription_id = failed
        .subscription_id
        .ok_or_else(|| ApiError::BadRequest("Payment has no subscription to retry".into()))?;

    let txn = db.begin().await?;
    let subscription = Subscriptions::find_by_id(subscription_id)
        .one(&txn)
        .await?
        .ok_or_else(|| ApiError::not_found("Subscription"))?;
    if subscription.is_effective(now) {
        return Err(ApiError::BadRequest(
            "User already has an active subscription.".into(),
        ));
    }
    let plan = SubscriptionPlans::find_by_id(subscription.plan_id)
        .one(&txn)
        .await?
        .ok_or_else(|| ApiError::not_found("Subscription plan"))?;

    let mut pending = subscription.into_active_model();
    pending.status = Set(SubscriptionStatus::Pending);
    pending.updated_at = Set(now);
    pending.update(&txn).await?;

    let payment = insert_payment(&txn, user_id, subscription_id, &plan, currency, now).await?;
    txn.commit().await?;

    tracing::info!(user_id, retried = payment_id, payment_id = payment.id, "payment retried");
    Ok(payment)
}

async fn settle(
    txn: &DatabaseTransaction,
    event: &WebhookPayload,
    now: DateTime,
) -> Result<WebhookOutcome> {
    let succeeded = match event.event_type.as_str() {
        PAYMENT_SUCCEEDED => true,
        PAYMENT_FAILED => false,
        _ => return Ok(WebhookOutcome::Ignored),
    };

    let payment = Payments::find_by_id(event.payment_id)
        .one(txn)
        .await?
        .ok_or_else(|| ApiError::not_found("Payment"))?;
    if !payment.status.is_pending() {
        tracing::info!(payment_id = payment.id, status = ?payment.status, "payment already settled");
        return Ok(WebhookOutcome::Ignored);
    }

    let payment_id = payment.id;
    let subscription_id = payment.subscription_id;
    let mut metadata = payment.metadata.clone();
    let reason = event.reason.clone().unwrap_or_else(|| "unknown".into());

    let mut active = payment.into_active_model();
    active.updated_at = Set(now);
    active.processed_at = Set(Some(now));
    if succeeded {
        active.status = Set(PaymentStatus::Succeeded);
    } else {
        if let Some(map) = metadata.as_object_mut() {
            map.insert("failure_reason".into(), json!(reason));
        }
        active.status = Set(PaymentStatus::Failed);
        active.metadata = Set(metadata);
    }
    active.update(txn).await?;

    let subscription = match subscription_id {
        Some(id) => Subscriptions::find_by_id(id).one(txn).await?,
        None => None,
    };
    if let Some(subscription) = subscription {
        if succeeded {
            let plan = SubscriptionPlans::find_by_id(subscription.plan_id)
                .one(txn)
                .await?
                .ok_or_else(|| ApiError::not_found("Subscription plan"))?;
            subs::activate(txn, subscription, &plan, Some(payment_id), now).await?;
        } else {
            subs::payment_failed(txn, subscription, payment_id, &reason, now).await?;
        }
    }

    tracing::info!(payment_id, succeeded, "payment settled");
    Ok(WebhookOutcome::Processed)
}

/// Applies a provider event once; replays of the same `event_id` are
/// reported as duplicates.
pub async fn handle_webhook(
    db: &DatabaseConnection,
    event: &WebhookPayload,
    raw: serde_json::Value,
    now: DateTime,
) -> Result<WebhookOutcome> {
    let txn = db.begin().await?;

    let seen = WebhookEvents::find()
        .filter(webhook_events::Column::EventId.eq(event.event_id.as_str()))
        .one(&txn)
        .await?;
    match seen {
        // Failed attempts may be redelivered.
        Some(previous) if previous.status == WebhookStatus::Failed => {
            WebhookEvents::delete_by_id(previous.id).exec(&txn).await?;
        }
        Some(_) => return Ok(WebhookOutcome::Duplicate),
        None => {}
    }

    let inserted = webhook_events::ActiveModel {
        provider: Set(PROVIDER.to_string()),
        event_id: Set(event.event_id.clone()),
        event_type: Set(event.event_type.clone()),
        status: Set(WebhookStatus::Pending),
        data: Set(raw.clone()),
        error_message: Set(None),
        processed_at: Set(None),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await;
    let record = match inserted {
        Ok(record) => record,
        Err(err) if is_unique_violation(&err) => return Ok(WebhookOutcome::Duplicate),
        Err(err) => return Err(err.into()),
    };

    match settle(&txn, event, now).await {
        Ok(outcome) => {
            let mut active = record.into_active_model();
            active.status = Set(match outcome {
                WebhookOutcome::Ignored => WebhookStatus::Ignored,
                _ => WebhookStatus::Processed,
            });
            active.processed_at = Set(Some(now));
            active.update(&txn).await?;
            txn.commit().await?;
            Ok(outcome)
        }
        Err(err) => {
            txn.rollback().await?;
            record_failed_event(db, event, raw, &err.to_string(), now).await;
            Err(err)
        }
    }
}

/// Keeps a trace of events whose processing was rolled back.
async fn record_failed_event(
    db: &DatabaseConnection,
    event: &WebhookPayload,
    raw: serde_json::Value,
    message: &str,
    now: DateTime,
) {
    let stored = webhook_events::ActiveModel {
        provider: Set(PROVIDER.to_string()),
        event_id: Set(event.event_id.clone()),
        event_type: Set(event.event_type.clone()),
        status: Set(WebhookStatus::Failed),
        data: Set(raw),
        error_message: Set(Some(message.to_string())),
        processed_at: Set(Some(now)),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await;

    if let Err(err) = stored {
        tracing::warn!(event_id = %event.event_id, error = %err, "failed to record webhook failure");
    }
    tracing::warn!(event_id = %event.event_id, error = %message, "webhook processing failed");
}
