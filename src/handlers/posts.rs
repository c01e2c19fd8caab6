use chrono::{Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::json;

use super::{state, FieldErrors};
use crate::auth::{CurrentUser, OptionalUser};
use crate::entities::posts::PostStatus;
use crate::entities::{comments, pinned_posts, posts, prelude::*};
use crate::error::{ApiError, Result};
use crate::feed::{self, FeedOrdering, FeedScope};
use crate::http::{
    json, json_with_status, FromRequest, Json, Query, Request, Response, StatusCode,
};
use crate::models::{FeedQuery, PostInput, PostUpdate};
use crate::pins;
use crate::slug::unique_post_slug;
use crate::views;

const TOP_N: u64 = 10;
const FEATURED_PINNED: usize = 3;
const FEATURED_POPULAR: u64 = 6;

async fn by_slug<C: ConnectionTrait>(db: &C, slug: &str) -> Result<posts::Model> {
    Posts::find()
        .filter(posts::Column::Slug.eq(slug))
        .one(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Post"))
}

async fn check_category<C: ConnectionTrait>(db: &C, category: Option<i32>, errors: &mut FieldErrors) -> Result<()> {
    if let Some(id) = category {
        if Categories::find_by_id(id).one(db).await?.is_none() {
            errors.add("category", "Category does not exist.");
        }
    }
    Ok(())
}

/// Main feed. Authenticated viewers also see their own drafts.
pub async fn list(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let OptionalUser(viewer) = OptionalUser::from_request(&mut req).await?;
    let Query(params) = Query::<FeedQuery>::from_request(&mut req).await?;
    let ordering = FeedOrdering::parse(params.ordering.as_deref());
    let now = Utc::now();

    let scope = FeedScope::Main {
        viewer: viewer.as_ref().map(|u| u.id),
    };
    let entries = feed::load_feed(&state.db, scope, ordering, now).await?;

    Ok(json(json!({
        "count": entries.len(),
        "pinned_posts_count": feed::pinned_count(&entries, now),
        "results": views::post_summaries(&state.db, &entries, now).await?,
    })))
}

pub async fn create(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let Json(input) = Json::<PostInput>::from_request(&mut req).await?;

    let title = input.title.trim().to_string();
    let mut errors = FieldErrors::default();
    errors.require("title", &title);
    errors.require("content", &input.content);
    check_category(&state.db, input.category, &mut errors).await?;
    errors.finish()?;

    let now = Utc::now();
    let post = posts::ActiveModel {
        slug: Set(unique_post_slug(&state.db, &title, None).await?),
        title: Set(title),
        content: Set(input.content),
        category_id: Set(input.category),
        author_id: Set(user.id),
        status: Set(input.status.unwrap_or(PostStatus::Published)),
        created_at: Set(now),
        updated_at: Set(now),
        views_count: Set(0),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    tracing::info!(post_id = post.id, author_id = user.id, slug = %post.slug, "post created");
    let detail = views::single_post(&state.db, post, Some(&user), now).await?;
    Ok(json_with_status(StatusCode::Created, detail))
}

/// Drafts are visible to their author only. Each read bumps the view counter.
pub async fn detail(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let OptionalUser(viewer) = OptionalUser::from_request(&mut req).await?;
    let mut post = by_slug(&state.db, req.param("slug").unwrap_or_default()).await?;

    let is_author = viewer.as_ref().is_some_and(|u| u.id == post.author_id);
    if !post.is_published() && !is_author {
        return Err(ApiError::not_found("Post"));
    }

    let bumped = Posts::update_many()
        .col_expr(
            posts::Column::ViewsCount,
            Expr::col(posts::Column::ViewsCount).add(1),
        )
        .filter(posts::Column::Id.eq(post.id))
        .exec(&state.db)
        .await;
    match bumped {
        Ok(_) => post.views_count += 1,
        Err(err) => tracing::warn!(post_id = post.id, error = %err, "failed to count view"),
    }

    let detail = views::single_post(&state.db, post, viewer.as_ref(), Utc::now()).await?;
    Ok(json(detail))
}

pub async fn update(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let Json(input) = Json::<PostUpdate>::from_request(&mut req).await?;
    let post = by_slug(&state.db, req.param("slug").unwrap_or_default()).await?;

    if post.author_id != user.id {
        return Err(ApiError::Forbidden("You can only edit your own posts".into()));
    }

    let mut errors = FieldErrors::default();
    if let Some(title) = &input.title {
        errors.require("title", title);
    }
    if let Some(content) = &input.content {
        errors.require("content", content);
    }
    if let Some(category) = input.category {
        check_category(&state.db, category, &mut errors).await?;
    }
    errors.finish()?;

    let post_id = post.id;
    let mut active = post.into_active_model();
    if let Some(title) = input.title {
        let title = title.trim().to_string();
        active.slug = Set(unique_post_slug(&state.db, &title, Some(post_id)).await?);
        active.title = Set(title);
    }
    if let Some(content) = input.content {
        active.content = Set(content);
    }
    if let Some(category) = input.category {
        active.category_id = Set(category);
    }
    if let Some(status) = input.status {
        active.status = Set(status);
    }
    let now = Utc::now();
    active.updated_at = Set(now);
    let post = active.update(&state.db).await?;

    let detail = views::single_post(&state.db, post, Some(&user), now).await?;
    Ok(json(detail))
}

/// Removes the post along with its pin and comments.
pub async fn delete(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let post = by_slug(&state.db, req.param("slug").unwrap_or_default()).await?;

    if post.author_id != user.id {
        return Err(ApiError::Forbidden("You can only delete your own posts".into()));
    }

    let txn = state.db.begin().await?;
    PinnedPosts::delete_many()
        .filter(pinned_posts::Column::PostId.eq(post.id))
        .exec(&txn)
        .await?;
    Comments::delete_many()
        .filter(comments::Column::PostId.eq(post.id))
        .exec(&txn)
        .await?;
    Posts::delete_by_id(post.id).exec(&txn).await?;
    txn.commit().await?;

    tracing::info!(post_id = post.id, author_id = user.id, "post deleted");
    Ok(Response::default().with_status(StatusCode::NoContent))
}

pub async fn my_posts(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let Query(params) = Query::<FeedQuery>::from_request(&mut req).await?;
    let ordering = FeedOrdering::parse(params.ordering.as_deref());
    let now = Utc::now();

    let entries = feed::load_feed(&state.db, FeedScope::Author(user.id), ordering, now).await?;
    Ok(json(views::post_summaries(&state.db, &entries, now).await?))
}

async fn top_published(req: &mut Request, column: posts::Column) -> Result<Response> {
    let state = state(req).await?;
    let now = Utc::now();

    let posts = Posts::find()
        .filter(posts::Column::Status.eq(PostStatus::Published))
        .order_by_desc(column)
        .order_by_desc(posts::Column::Id)
        .limit(TOP_N)
        .all(&state.db)
        .await?;
    let entries = feed::attach_pins(&state.db, posts).await?;
    Ok(json(views::post_summaries(&state.db, &entries, now).await?))
}

/// Ten most viewed published posts.
pub async fn popular(mut req: Request, _res: Response) -> Result<Response> {
    top_published(&mut req, posts::Column::ViewsCount).await
}

/// Ten newest published posts.
pub async fn recent(mut req: Request, _res: Response) -> Result<Response> {
    top_published(&mut req, posts::Column::CreatedAt).await
}

/// Only effectively pinned posts.
pub async fn pinned(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let now = Utc::now();

    let entries = feed::load_pinned(&state.db, now).await?;
    Ok(json(json!({
        "count": entries.len(),
        "results": views::post_summaries(&state.db, &entries, now).await?,
    })))
}

/// A few pinned posts plus the most viewed posts of the last week.
pub async fn featured(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let now = Utc::now();
    let since = now - Duration::days(7);

    let all_pinned = feed::load_pinned(&state.db, now).await?;
    let total_pinned = all_pinned.len();
    let pinned: Vec<_> = all_pinned.into_iter().take(FEATURED_PINNED).collect();
    let pinned_ids: Vec<i32> = pinned.iter().map(|e| e.post.id).collect();

    let mut query = Posts::find()
        .filter(posts::Column::Status.eq(PostStatus::Published))
        .filter(posts::Column::CreatedAt.gte(since));
    if !pinned_ids.is_empty() {
        query = query.filter(posts::Column::Id.is_not_in(pinned_ids));
    }
    let recent = query
        .order_by_desc(posts::Column::ViewsCount)
        .order_by_desc(posts::Column::Id)
        .limit(FEATURED_POPULAR)
        .all(&state.db)
        .await?;
    let popular = feed::attach_pins(&state.db, recent).await?;

    Ok(json(json!({
        "pinned_posts": views::post_summaries(&state.db, &pinned, now).await?,
        "popular_posts": views::post_summaries(&state.db, &popular, now).await?,
        "total_pinned": total_pinned,
    })))
}

pub async fn toggle_pin(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let slug = req.param("slug").unwrap_or_default().to_string();
    let now = Utc::now();

    let outcome = pins::toggle(&state.db, &user, &slug, now).await?;
    let message = if outcome.is_pinned {
        "Post pinned successfully"
    } else {
        "Post unpinned successfully"
    };

    let post = views::single_post(&state.db, outcome.post, Some(&user), now).await?;
    Ok(json(json!({
        "message": message,
        "is_pinned": outcome.is_pinned,
        "post": post,
    })))
}
