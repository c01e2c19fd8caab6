use chrono::Utc;
use sea_orm::EntityTrait;
use serde_json::{json, Value};

use super::{id_param, state};
use crate::auth::CurrentUser;
use crate::entities::prelude::*;
use crate::error::{ApiError, Result};
use crate::http::{json, json_with_status, FromRequest, Json, Request, Response, StatusCode};
use crate::models::{CheckoutInput, PaymentOut, SubscriptionOut, WebhookPayload};
use crate::payments;

pub const SECRET_HEADER: &str = "X-Webhook-Secret";

pub async fn list(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;

    let payments = payments::list(&state.db, user.id).await?;
    Ok(json(payments.iter().map(PaymentOut::from).collect::<Vec<_>>()))
}

pub async fn detail(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let id = id_param(&req, "id", "Payment")?;

    let payment = payments::get(&state.db, user.id, id).await?;
    Ok(json(PaymentOut::from(&payment)))
}

pub async fn status(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let id = id_param(&req, "id", "Payment")?;

    let payment = payments::get(&state.db, user.id, id).await?;
    let subscription = match payment.subscription_id {
        Some(id) => Subscriptions::find_by_id(id).one(&state.db).await?,
        None => None,
    };

    Ok(json(json!({
        "id": payment.id,
        "status": payment.status,
        "amount": crate::models::format_cents(payment.amount_cents),
        "currency": payment.currency,
        "processed_at": payment.processed_at,
        "subscription_status": subscription.map(|s| s.status),
    })))
}

pub async fn checkout(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let Json(input) = Json::<CheckoutInput>::from_request(&mut req).await?;
    let now = Utc::now();

    let (payment, subscription) = payments::checkout(
        &state.db,
        &user,
        input.plan_id,
        &state.config.payments.currency,
        now,
    )
    .await?;
    let plan = SubscriptionPlans::find_by_id(subscription.plan_id)
        .one(&state.db)
        .await?;

    Ok(json_with_status(
        StatusCode::Created,
        json!({
            "payment": PaymentOut::from(&payment),
            "subscription": SubscriptionOut::new(&subscription, &user, plan.as_ref(), now),
        }),
    ))
}

pub async fn cancel(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let id = id_param(&req, "id", "Payment")?;

    let payment = payments::cancel(&state.db, user.id, id, Utc::now()).await?;
    Ok(json(json!({
        "message": "Payment cancelled successfully",
        "payment": PaymentOut::from(&payment),
    })))
}

pub async fn retry(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let id = id_param(&req, "id", "Payment")?;

    let payment = payments::retry(
        &state.db,
        user.id,
        id,
        &state.config.payments.currency,
        Utc::now(),
    )
    .await?;
    Ok(json_with_status(
        StatusCode::Created,
        json!({
            "message": "Payment retry created",
            "payment": PaymentOut::from(&payment),
        }),
    ))
}

/// Provider callback. Without a configured secret every call is refused.
pub async fn webhook(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;

    let expected = state.config.payments.webhook_secret.as_str();
    if expected.is_empty() || req.header(SECRET_HEADER) != Some(expected) {
        tracing::warn!(remote = ?req.remote_addr, "webhook rejected: bad secret");
        return Err(ApiError::Unauthorized("Invalid webhook secret".into()));
    }

    let Json(raw) = Json::<Value>::from_request(&mut req).await?;
    let event: WebhookPayload = serde_json::from_value(raw.clone())?;

    let outcome = payments::handle_webhook(&state.db, &event, raw, Utc::now()).await?;
    tracing::info!(event_id = %event.event_id, event_type = %event.event_type, outcome = outcome.as_str(), "webhook handled");
    Ok(json(json!({ "status": outcome.as_str() })))
}
