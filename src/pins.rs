//! The single pin slot of each user.
//!
//! Every operation that writes `pinned_posts` runs in one transaction that
//! reads the caller's subscription and pin rows with row locks. The unique
//! index on `pinned_posts.user_id` backs the one-pin-per-user rule when two
//! requests race anyway.

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;

use crate::entities::posts::PostStatus;
use crate::entities::{pinned_posts, posts, prelude::*, subscriptions, users};
use crate::error::{ApiError, Result};
use crate::feed::DateTime;

pub const SUBSCRIPTION_REQUIRED: &str = "Active subscription required to pin posts";

#[derive(Debug)]
pub struct ToggleOutcome {
    pub is_pinned: bool,
    pub post: posts::Model,
}

/// Outcome of a dry-run pin check, with one flag per precondition.
#[derive(Debug, Clone, Serialize)]
pub struct CanPinReport {
    pub can_pin: bool,
    pub reason: Option<String>,
    pub checks: PinChecks,
}

#[derive(Debug, Clone, Serialize)]
pub struct PinChecks {
    pub post_exists: bool,
    pub is_own_post: bool,
    pub is_published: bool,
    pub has_subscription: bool,
    pub subscription_active: bool,
}

/// Everything that is not already a client error is reported as a bad
/// request carrying the underlying message.
fn aborted(err: ApiError) -> ApiError {
    match err {
        ApiError::Database(db) => ApiError::BadRequest(db.to_string()),
        other => other,
    }
}

async fn begin(db: &DatabaseConnection) -> Result<DatabaseTransaction> {
    db.begin().await.map_err(|e| aborted(e.into()))
}

async fn finish<T>(txn: DatabaseTransaction, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            txn.commit().await.map_err(|e| aborted(e.into()))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = txn.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(aborted(err))
        }
    }
}

/// Locks and returns the user's subscription when it is effective.
async fn require_subscription(
    txn: &DatabaseTransaction,
    user_id: i32,
    now: DateTime,
) -> Result<subscriptions::Model> {
    Subscriptions::find()
        .filter(subscriptions::Column::UserId.eq(user_id))
        .lock_exclusive()
        .one(txn)
        .await?
        .filter(|s| s.is_effective(now))
        .ok_or_else(|| ApiError::Forbidden(SUBSCRIPTION_REQUIRED.into()))
}

async fn replace_pin(
    txn: &DatabaseTransaction,
    user_id: i32,
    post_id: i32,
    now: DateTime,
) -> Result<pinned_posts::Model> {
    PinnedPosts::delete_many()
        .filter(pinned_posts::Column::UserId.eq(user_id))
        .exec(txn)
        .await?;

    let pin = pinned_posts::ActiveModel {
        user_id: Set(user_id),
        post_id: Set(post_id),
        pinned_at: Set(now),
        ..Default::default()
    }
    .insert(txn)
    .await?;
    Ok(pin)
}

async fn toggle_locked(
    txn: &DatabaseTransaction,
    user_id: i32,
    post_id: i32,
    now: DateTime,
) -> Result<bool> {
    require_subscription(txn, user_id, now).await?;

    let existing = PinnedPosts::find()
        .filter(pinned_posts::Column::PostId.eq(post_id))
        .lock_exclusive()
        .one(txn)
        .await?;

    match existing {
        Some(pin) => {
            PinnedPosts::delete_by_id(pin.id).exec(txn).await?;
            Ok(false)
        }
        None => {
            replace_pin(txn, user_id, post_id, now).await?;
            Ok(true)
        }
    }
}

/// Pins the caller's published post `slug`, or unpins it when it already is.
/// Pinning replaces whatever the caller had pinned before.
pub async fn toggle(
    db: &DatabaseConnection,
    user: &users::Model,
    slug: &str,
    now: DateTime,
) -> Result<ToggleOutcome> {
    let post = Posts::find()
        .filter(posts::Column::Slug.eq(slug))
        .filter(posts::Column::AuthorId.eq(user.id))
        .filter(posts::Column::Status.eq(PostStatus::Published))
        .one(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Post"))?;

    let txn = begin(db).await?;
    let result = toggle_locked(&txn, user.id, post.id, now).await;
    let is_pinned = finish(txn, result).await?;

    tracing::info!(user_id = user.id, post_id = post.id, is_pinned, "pin toggled");
    Ok(ToggleOutcome { is_pinned, post })
}

/// Pins `post_id` for the caller, replacing any previous pin.
pub async fn pin_post(
    db: &DatabaseConnection,
    user: &users::Model,
    post_id: i32,
    now: DateTime,
) -> Result<(pinned_posts::Model, posts::Model)> {
    let post = Posts::find_by_id(post_id)
        .one(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Post"))?;
    if post.author_id != user.id {
        return Err(ApiError::Forbidden("You can only pin your own posts".into()));
    }
    if !post.is_published() {
        return Err(ApiError::BadRequest("Only published posts can be pinned".into()));
    }

    let txn = begin(db).await?;
    let result = async {
        require_subscription(&txn, user.id, now).await?;
        replace_pin(&txn, user.id, post.id, now).await
    }
    .await;
    let pin = finish(txn, result).await?;

    tracing::info!(user_id = user.id, post_id = post.id, "post pinned");
    Ok((pin, post))
}

/// Removes the caller's pin.
pub async fn unpin(db: &DatabaseConnection, user: &users::Model) -> Result<()> {
    let txn = begin(db).await?;
    let result = async {
        let deleted = PinnedPosts::delete_many()
            .filter(pinned_posts::Column::UserId.eq(user.id))
            .exec(&txn)
            .await?;
        if deleted.rows_affected == 0 {
            return Err(ApiError::NotFound("No pinned post found".into()));
        }
        Ok(())
    }
    .await;
    finish(txn, result).await?;

    tracing::info!(user_id = user.id, "post unpinned");
    Ok(())
}

/// The caller's pin record and the pinned post.
pub async fn current_pin(
    db: &DatabaseConnection,
    user: &users::Model,
) -> Result<(pinned_posts::Model, posts::Model)> {
    let found = PinnedPosts::find()
        .filter(pinned_posts::Column::UserId.eq(user.id))
        .find_also_related(Posts)
        .one(db)
        .await?;

    match found {
        Some((pin, Some(post))) => Ok((pin, post)),
        _ => Err(ApiError::NotFound("No pinned post found".into())),
    }
}

/// Reports whether the caller may pin `post_id`, without changing anything.
pub async fn can_pin(
    db: &DatabaseConnection,
    user: &users::Model,
    post_id: i32,
    now: DateTime,
) -> Result<CanPinReport> {
    let post = Posts::find_by_id(post_id).one(db).await?;
    let subscription = Subscriptions::find()
        .filter(subscriptions::Column::UserId.eq(user.id))
        .one(db)
        .await?;

    let checks = PinChecks {
        post_exists: post.is_some(),
        is_own_post: post.as_ref().is_some_and(|p| p.author_id == user.id),
        is_published: post.as_ref().is_some_and(|p| p.is_published()),
        has_subscription: subscription.is_some(),
        subscription_active: subscription.as_ref().is_some_and(|s| s.is_effective(now)),
    };

    let reason = if !checks.post_exists {
        Some("Post not found")
    } else if !checks.is_own_post {
        Some("You can only pin your own posts")
    } else if !checks.is_published {
        Some("Only published posts can be pinned")
    } else if !checks.subscription_active {
        Some(SUBSCRIPTION_REQUIRED)
    } else {
        None
    };

    Ok(CanPinReport {
        can_pin: reason.is_none(),
        reason: reason.map(str::to_string),
        checks,
    })
}

/// Whether `user` could pin `post` right now; used for `can_pin` on post detail.
pub fn may_pin(
    post: &posts::Model,
    user: &users::Model,
    subscription: Option<&subscriptions::Model>,
    now: DateTime,
) -> bool {
    post.author_id == user.id
        && post.is_published()
        && subscription.is_some_and(|s| s.is_effective(now))
}
