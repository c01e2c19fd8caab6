//! Builds the JSON representations of posts from feed entries, loading the
//! related authors, categories and comment counts in batches.

use std::collections::HashMap;

use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QuerySelect};

use crate::entities::{categories, comments, prelude::*, subscriptions, users};
use crate::feed::{attach_pins, DateTime, FeedEntry};
use crate::models::{
    preview, AuthorInfo, CategoryInfo, PinnedBy, PinnedInfo, PostDetail, PostSummary,
};
use crate::pins::may_pin;

struct Lookups {
    users: HashMap<i32, users::Model>,
    categories: HashMap<i32, categories::Model>,
    comment_counts: HashMap<i32, u64>,
}

async fn lookups<C>(db: &C, entries: &[FeedEntry]) -> Result<Lookups, DbErr>
where
    C: ConnectionTrait,
{
    let mut user_ids: Vec<i32> = entries.iter().map(|e| e.post.author_id).collect();
    user_ids.extend(entries.iter().filter_map(|e| e.pin.as_ref().map(|p| p.record.user_id)));
    user_ids.sort_unstable();
    user_ids.dedup();

    let category_ids: Vec<i32> = entries.iter().filter_map(|e| e.post.category_id).collect();
    let post_ids: Vec<i32> = entries.iter().map(|e| e.post.id).collect();

    let users = if user_ids.is_empty() {
        Vec::new()
    } else {
        Users::find()
            .filter(users::Column::Id.is_in(user_ids))
            .all(db)
            .await?
    };
    let categories = if category_ids.is_empty() {
        Vec::new()
    } else {
        Categories::find()
            .filter(categories::Column::Id.is_in(category_ids))
            .all(db)
            .await?
    };

    Ok(Lookups {
        users: users.into_iter().map(|u| (u.id, u)).collect(),
        categories: categories.into_iter().map(|c| (c.id, c)).collect(),
        comment_counts: comment_counts(db, post_ids).await?,
    })
}

/// Active comments per post.
pub async fn comment_counts<C>(db: &C, post_ids: Vec<i32>) -> Result<HashMap<i32, u64>, DbErr>
where
    C: ConnectionTrait,
{
    if post_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(i32, i64)> = Comments::find()
        .select_only()
        .column(comments::Column::PostId)
        .column_as(Expr::col(comments::Column::Id).count(), "count")
        .filter(comments::Column::IsActive.eq(true))
        .filter(comments::Column::PostId.is_in(post_ids))
        .group_by(comments::Column::PostId)
        .into_tuple()
        .all(db)
        .await?;
    Ok(rows
        .into_iter()
        .map(|(post_id, count)| (post_id, count.max(0) as u64))
        .collect())
}

fn summary(entry: &FeedEntry, lookups: &Lookups, now: DateTime, truncate: bool) -> PostSummary {
    let post = &entry.post;

    let pinned_info = match &entry.pin {
        Some(pin) => PinnedInfo {
            is_pinned: pin.is_effective(now),
            pinned_at: Some(pin.record.pinned_at),
            pinned_by: lookups.users.get(&pin.record.user_id).map(|u| PinnedBy {
                id: u.id,
                username: u.username.clone(),
                has_active_subscription: pin.owner_has_active_subscription(now),
            }),
        },
        None => PinnedInfo::unpinned(),
    };

    PostSummary {
        id: post.id,
        title: post.title.clone(),
        slug: post.slug.clone(),
        content: if truncate {
            preview(&post.content)
        } else {
            post.content.clone()
        },
        category: post
            .category_id
            .and_then(|id| lookups.categories.get(&id))
            .map(|c| c.name.clone()),
        author: lookups
            .users
            .get(&post.author_id)
            .map(|u| u.username.clone())
            .unwrap_or_default(),
        status: post.status,
        created_at: post.created_at,
        updated_at: post.updated_at,
        views_count: post.views_count,
        comments_count: lookups.comment_counts.get(&post.id).copied().unwrap_or(0),
        is_pinned: entry.is_pinned(now),
        pinned_info,
    }
}

/// List representation, content truncated.
pub async fn post_summaries<C>(
    db: &C,
    entries: &[FeedEntry],
    now: DateTime,
) -> Result<Vec<PostSummary>, DbErr>
where
    C: ConnectionTrait,
{
    let lookups = lookups(db, entries).await?;
    Ok(entries
        .iter()
        .map(|entry| summary(entry, &lookups, now, true))
        .collect())
}

/// Detail representation for `viewer`.
pub async fn post_detail<C>(
    db: &C,
    entry: &FeedEntry,
    viewer: Option<&users::Model>,
    now: DateTime,
) -> Result<PostDetail, DbErr>
where
    C: ConnectionTrait,
{
    let lookups = lookups(db, std::slice::from_ref(entry)).await?;

    let can_pin = match viewer {
        Some(user) => {
            let subscription = Subscriptions::find()
                .filter(subscriptions::Column::UserId.eq(user.id))
                .one(db)
                .await?;
            may_pin(&entry.post, user, subscription.as_ref(), now)
        }
        None => false,
    };

    Ok(PostDetail {
        summary: summary(entry, &lookups, now, false),
        category_info: entry
            .post
            .category_id
            .and_then(|id| lookups.categories.get(&id))
            .map(CategoryInfo::from),
        author_info: lookups.users.get(&entry.post.author_id).map(AuthorInfo::from),
        can_pin,
    })
}

/// Detail representation of a single post, loading its pin first.
pub async fn single_post<C>(
    db: &C,
    post: crate::entities::posts::Model,
    viewer: Option<&users::Model>,
    now: DateTime,
) -> Result<PostDetail, DbErr>
where
    C: ConnectionTrait,
{
    let entries = attach_pins(db, vec![post]).await?;
    match entries.first() {
        Some(entry) => post_detail(db, entry, viewer, now).await,
        None => Err(DbErr::RecordNotFound("post".into())),
    }
}
