use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde_json::{json, Value};

use super::{id_param, state};
use crate::auth::CurrentUser;
use crate::entities::{pinned_posts, posts, prelude::*, subscription_plans, users};
use crate::error::{ApiError, Result};
use crate::feed::{self, DateTime};
use crate::http::{json, FromRequest, Json, Request, Response};
use crate::models::{PinPostInput, PlanOut, SubscriptionOut};
use crate::{pins, subscriptions as subs, views};

async fn pinned_record(
    db: &DatabaseConnection,
    pin: &pinned_posts::Model,
    post: posts::Model,
    viewer: &users::Model,
    now: DateTime,
) -> Result<Value> {
    Ok(json!({
        "id": pin.id,
        "pinned_at": pin.pinned_at,
        "post": views::single_post(db, post, Some(viewer), now).await?,
    }))
}

async fn represent(
    db: &DatabaseConnection,
    subscription: &crate::entities::subscriptions::Model,
    user: &users::Model,
    now: DateTime,
) -> Result<SubscriptionOut> {
    let plan = SubscriptionPlans::find_by_id(subscription.plan_id).one(db).await?;
    Ok(SubscriptionOut::new(subscription, user, plan.as_ref(), now))
}

pub async fn plans(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let plans = subs::active_plans(&state.db).await?;
    Ok(json(plans.iter().map(PlanOut::from).collect::<Vec<_>>()))
}

pub async fn plan_detail(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let id = id_param(&req, "id", "Subscription plan")?;
    let plan = SubscriptionPlans::find_by_id(id)
        .filter(subscription_plans::Column::IsActive.eq(true))
        .one(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Subscription plan"))?;
    Ok(json(PlanOut::from(&plan)))
}

pub async fn my_subscription(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;

    let subscription = subs::for_user(&state.db, user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("No subscription found".into()))?;
    Ok(json(represent(&state.db, &subscription, &user, Utc::now()).await?))
}

/// Summary of the caller's subscription and pin. The pinned post is only
/// reported while the subscription is effective.
pub async fn status(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let now = Utc::now();

    let subscription = subs::for_user(&state.db, user.id).await?;
    let is_active = subscription.as_ref().is_some_and(|s| s.is_effective(now));

    let out = match &subscription {
        Some(s) => Some(represent(&state.db, s, &user, now).await?),
        None => None,
    };
    let pinned_post = if is_active {
        match pins::current_pin(&state.db, &user).await {
            Ok((pin, post)) => Some(pinned_record(&state.db, &pin, post, &user, now).await?),
            Err(ApiError::NotFound(_)) => None,
            Err(err) => return Err(err),
        }
    } else {
        None
    };

    Ok(json(json!({
        "has_subscription": subscription.is_some(),
        "is_active": is_active,
        "subscription": out,
        "pinned_post": pinned_post,
        "can_pin_posts": is_active,
    })))
}

pub async fn history(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;

    let entries = match subs::for_user(&state.db, user.id).await? {
        Some(subscription) => subs::history(&state.db, subscription.id).await?,
        None => Vec::new(),
    };
    let out: Vec<Value> = entries
        .iter()
        .map(|h| {
            json!({
                "id": h.id,
                "action": h.action,
                "description": h.description,
                "metadata": h.metadata,
                "created_at": h.created_at,
            })
        })
        .collect();
    Ok(json(out))
}

pub async fn cancel(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let now = Utc::now();

    let subscription = subs::cancel(&state.db, user.id, now).await?;
    Ok(json(json!({
        "message": "Subscription cancelled successfully",
        "subscription": represent(&state.db, &subscription, &user, now).await?,
    })))
}

/// Every effectively pinned post, in feed order.
pub async fn pinned_posts(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let now = Utc::now();

    let entries = feed::load_pinned(&state.db, now).await?;
    Ok(json(views::post_summaries(&state.db, &entries, now).await?))
}

pub async fn can_pin(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let post_id = id_param(&req, "post_id", "Post")?;

    let report = pins::can_pin(&state.db, &user, post_id, Utc::now()).await?;
    Ok(json(report))
}

pub async fn pin_post(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let Json(input) = Json::<PinPostInput>::from_request(&mut req).await?;
    let now = Utc::now();

    let (pin, post) = pins::pin_post(&state.db, &user, input.post_id, now).await?;
    Ok(json(json!({
        "message": "Post pinned successfully",
        "pinned_post": pinned_record(&state.db, &pin, post, &user, now).await?,
    })))
}

pub async fn unpin_post(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;

    pins::unpin(&state.db, &user).await?;
    Ok(json(json!({ "message": "Post unpinned successfully" })))
}

pub async fn pinned_post(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let now = Utc::now();

    let (pin, post) = pins::current_pin(&state.db, &user).await?;
    Ok(json(pinned_record(&state.db, &pin, post, &user, now).await?))
}
