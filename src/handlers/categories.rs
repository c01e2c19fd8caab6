use std::collections::HashMap;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::json;

use super::{state, FieldErrors};
use crate::auth::CurrentUser;
use crate::entities::posts::PostStatus;
use crate::entities::{categories, posts, prelude::*};
use crate::error::{is_unique_violation, ApiError, Result};
use crate::feed::{self, FeedOrdering, FeedScope};
use crate::http::{json, json_with_status, FromRequest, Json, Request, Response, StatusCode};
use crate::models::{CategoryInput, CategoryOut, CategoryUpdate};
use crate::slug::slugify;
use crate::views;

/// Published posts per category.
async fn posts_counts<C: ConnectionTrait>(db: &C) -> std::result::Result<HashMap<i32, u64>, DbErr> {
    let rows: Vec<(Option<i32>, i64)> = Posts::find()
        .select_only()
        .column(posts::Column::CategoryId)
        .column_as(Expr::col(posts::Column::Id).count(), "count")
        .filter(posts::Column::Status.eq(PostStatus::Published))
        .filter(posts::Column::CategoryId.is_not_null())
        .group_by(posts::Column::CategoryId)
        .into_tuple()
        .all(db)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|(id, count)| id.map(|id| (id, count.max(0) as u64)))
        .collect())
}

async fn by_slug<C: ConnectionTrait>(db: &C, slug: &str) -> Result<categories::Model> {
    Categories::find()
        .filter(categories::Column::Slug.eq(slug))
        .one(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Category"))
}

async fn represent<C: ConnectionTrait>(db: &C, category: &categories::Model) -> Result<CategoryOut> {
    let counts = posts_counts(db).await?;
    Ok(CategoryOut::new(
        category,
        counts.get(&category.id).copied().unwrap_or(0),
    ))
}

fn name_taken(err: DbErr) -> ApiError {
    if is_unique_violation(&err) {
        ApiError::Conflict("Category with this name already exists".into())
    } else {
        err.into()
    }
}

fn validated_slug(name: &str) -> Result<String> {
    let mut errors = FieldErrors::default();
    errors.require("name", name);
    let slug = slugify(name);
    if slug.is_empty() && !name.trim().is_empty() {
        errors.add("name", "Name must contain letters or digits.");
    }
    errors.finish()?;
    Ok(slug)
}

pub async fn list(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let categories = Categories::find()
        .order_by_asc(categories::Column::Name)
        .all(&state.db)
        .await?;
    let counts = posts_counts(&state.db).await?;

    let out: Vec<CategoryOut> = categories
        .iter()
        .map(|c| CategoryOut::new(c, counts.get(&c.id).copied().unwrap_or(0)))
        .collect();
    Ok(json(out))
}

pub async fn create(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(_) = CurrentUser::from_request(&mut req).await?;
    let Json(input) = Json::<CategoryInput>::from_request(&mut req).await?;

    let name = input.name.trim().to_string();
    let slug = validated_slug(&name)?;
    let category = categories::ActiveModel {
        name: Set(name),
        slug: Set(slug),
        description: Set(input.description),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(&state.db)
    .await
    .map_err(name_taken)?;

    tracing::info!(category_id = category.id, slug = %category.slug, "category created");
    Ok(json_with_status(
        StatusCode::Created,
        represent(&state.db, &category).await?,
    ))
}

pub async fn detail(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let category = by_slug(&state.db, req.param("slug").unwrap_or_default()).await?;
    Ok(json(represent(&state.db, &category).await?))
}

pub async fn update(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(_) = CurrentUser::from_request(&mut req).await?;
    let Json(input) = Json::<CategoryUpdate>::from_request(&mut req).await?;
    let category = by_slug(&state.db, req.param("slug").unwrap_or_default()).await?;

    let mut active = category.into_active_model();
    if let Some(name) = input.name {
        let name = name.trim().to_string();
        active.slug = Set(validated_slug(&name)?);
        active.name = Set(name);
    }
    if let Some(description) = input.description {
        active.description = Set(description);
    }
    let category = active.update(&state.db).await.map_err(name_taken)?;

    Ok(json(represent(&state.db, &category).await?))
}

/// Posts of the category keep existing without one.
pub async fn delete(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(_) = CurrentUser::from_request(&mut req).await?;
    let category = by_slug(&state.db, req.param("slug").unwrap_or_default()).await?;

    let txn = state.db.begin().await?;
    Posts::update_many()
        .col_expr(posts::Column::CategoryId, Expr::value(Option::<i32>::None))
        .filter(posts::Column::CategoryId.eq(category.id))
        .exec(&txn)
        .await?;
    Categories::delete_by_id(category.id).exec(&txn).await?;
    txn.commit().await?;

    tracing::info!(category_id = category.id, "category deleted");
    Ok(Response::default().with_status(StatusCode::NoContent))
}

/// Published posts of a category in feed order.
pub async fn posts(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let category = by_slug(&state.db, req.param("slug").unwrap_or_default()).await?;
    let ordering = FeedOrdering::parse(req.query("ordering"));
    let now = Utc::now();

    let entries =
        feed::load_feed(&state.db, FeedScope::Category(category.id), ordering, now).await?;
    let pinned = feed::pinned_count(&entries, now);

    Ok(json(json!({
        "category": represent(&state.db, &category).await?,
        "posts": views::post_summaries(&state.db, &entries, now).await?,
        "pinned_posts_count": pinned,
    })))
}
