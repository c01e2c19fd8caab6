use std::collections::HashMap;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::json;

use super::{id_param, state, FieldErrors};
use crate::auth::CurrentUser;
use crate::entities::{comments, posts, prelude::*, users};
use crate::error::{ApiError, Result};
use crate::http::{json, json_with_status, FromRequest, Json, Request, Response, StatusCode};
use crate::models::{CommentInput, CommentOut, CommentUpdate, PostBrief};

async fn reply_counts<C: ConnectionTrait>(
    db: &C,
    parent_ids: Vec<i32>,
) -> std::result::Result<HashMap<i32, u64>, DbErr> {
    if parent_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(Option<i32>, i64)> = Comments::find()
        .select_only()
        .column(comments::Column::ParentId)
        .column_as(Expr::col(comments::Column::Id).count(), "count")
        .filter(comments::Column::ParentId.is_in(parent_ids))
        .filter(comments::Column::IsActive.eq(true))
        .group_by(comments::Column::ParentId)
        .into_tuple()
        .all(db)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|(id, count)| id.map(|id| (id, count.max(0) as u64)))
        .collect())
}

/// Representations with authors and reply counts loaded in two queries.
async fn represent<C: ConnectionTrait>(db: &C, comments: &[comments::Model]) -> Result<Vec<CommentOut>> {
    let mut author_ids: Vec<i32> = comments.iter().map(|c| c.author_id).collect();
    author_ids.sort_unstable();
    author_ids.dedup();

    let authors: HashMap<i32, users::Model> = if author_ids.is_empty() {
        HashMap::new()
    } else {
        Users::find()
            .filter(users::Column::Id.is_in(author_ids))
            .all(db)
            .await?
            .into_iter()
            .map(|u| (u.id, u))
            .collect()
    };
    let replies = reply_counts(db, comments.iter().map(|c| c.id).collect()).await?;

    Ok(comments
        .iter()
        .map(|c| {
            CommentOut::new(
                c,
                authors.get(&c.author_id),
                replies.get(&c.id).copied().unwrap_or(0),
            )
        })
        .collect())
}

async fn active_replies<C: ConnectionTrait>(db: &C, parent_ids: Vec<i32>) -> Result<Vec<comments::Model>> {
    if parent_ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(Comments::find()
        .filter(comments::Column::ParentId.is_in(parent_ids))
        .filter(comments::Column::IsActive.eq(true))
        .order_by_asc(comments::Column::CreatedAt)
        .order_by_asc(comments::Column::Id)
        .all(db)
        .await?)
}

/// Top-level comments with their active replies nested, oldest reply first.
async fn threaded<C: ConnectionTrait>(db: &C, top: &[comments::Model]) -> Result<Vec<CommentOut>> {
    let replies = active_replies(db, top.iter().map(|c| c.id).collect()).await?;
    let mut nested: HashMap<i32, Vec<CommentOut>> = HashMap::new();
    for (reply, out) in replies.iter().zip(represent(db, &replies).await?) {
        if let Some(parent) = reply.parent_id {
            nested.entry(parent).or_default().push(out);
        }
    }

    let mut outs = represent(db, top).await?;
    for out in &mut outs {
        out.replies = Some(nested.remove(&out.id).unwrap_or_default());
    }
    Ok(outs)
}

async fn active_comment<C: ConnectionTrait>(db: &C, id: i32) -> Result<comments::Model> {
    Comments::find_by_id(id)
        .filter(comments::Column::IsActive.eq(true))
        .one(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Comment"))
}

async fn owned_comment<C: ConnectionTrait>(db: &C, id: i32, user: &users::Model) -> Result<comments::Model> {
    let comment = active_comment(db, id).await?;
    if comment.author_id != user.id {
        return Err(ApiError::Forbidden("You can only modify your own comments".into()));
    }
    Ok(comment)
}

/// Active comments, newest first. `?post=<id>` narrows to one post.
pub async fn list(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;

    let mut query = Comments::find().filter(comments::Column::IsActive.eq(true));
    if let Some(post_id) = req.query("post").and_then(|p| p.parse::<i32>().ok()) {
        query = query.filter(comments::Column::PostId.eq(post_id));
    }
    let comments = query
        .order_by_desc(comments::Column::CreatedAt)
        .order_by_desc(comments::Column::Id)
        .all(&state.db)
        .await?;

    Ok(json(represent(&state.db, &comments).await?))
}

pub async fn create(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let Json(input) = Json::<CommentInput>::from_request(&mut req).await?;

    let mut errors = FieldErrors::default();
    errors.require("content", &input.content);

    let post = Posts::find_by_id(input.post).one(&state.db).await?;
    match &post {
        Some(post) if post.is_published() => {}
        _ => errors.add("post", "Post does not exist or is not published."),
    }
    if let Some(parent_id) = input.parent {
        let parent = Comments::find_by_id(parent_id).one(&state.db).await?;
        let valid = parent.is_some_and(|p| p.is_active && p.post_id == input.post);
        if !valid {
            errors.add("parent", "Parent comment must be an active comment on the same post.");
        }
    }
    errors.finish()?;

    let now = Utc::now();
    let comment = comments::ActiveModel {
        post_id: Set(input.post),
        author_id: Set(user.id),
        parent_id: Set(input.parent),
        content: Set(input.content.trim().to_string()),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    tracing::info!(comment_id = comment.id, post_id = comment.post_id, author_id = user.id, "comment created");
    Ok(json_with_status(
        StatusCode::Created,
        CommentOut::new(&comment, Some(&user), 0),
    ))
}

pub async fn detail(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let id = id_param(&req, "id", "Comment")?;
    let comment = active_comment(&state.db, id).await?;

    let out = if comment.is_reply() {
        represent(&state.db, std::slice::from_ref(&comment)).await?
    } else {
        threaded(&state.db, std::slice::from_ref(&comment)).await?
    };
    Ok(json(out.into_iter().next()))
}

pub async fn update(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let Json(input) = Json::<CommentUpdate>::from_request(&mut req).await?;
    let id = id_param(&req, "id", "Comment")?;
    let comment = owned_comment(&state.db, id, &user).await?;

    let mut errors = FieldErrors::default();
    errors.require("content", &input.content);
    errors.finish()?;

    let mut active = comment.into_active_model();
    active.content = Set(input.content.trim().to_string());
    active.updated_at = Set(Utc::now());
    let comment = active.update(&state.db).await?;

    let out = represent(&state.db, std::slice::from_ref(&comment)).await?;
    Ok(json(out.into_iter().next()))
}

/// Soft delete: the comment is deactivated, its replies stay.
pub async fn delete(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let id = id_param(&req, "id", "Comment")?;
    let comment = owned_comment(&state.db, id, &user).await?;

    let mut active = comment.into_active_model();
    active.is_active = Set(false);
    active.updated_at = Set(Utc::now());
    active.update(&state.db).await?;

    tracing::info!(comment_id = id, author_id = user.id, "comment deactivated");
    Ok(Response::default().with_status(StatusCode::NoContent))
}

pub async fn my_comments(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;

    let comments = Comments::find()
        .filter(comments::Column::AuthorId.eq(user.id))
        .filter(comments::Column::IsActive.eq(true))
        .order_by_desc(comments::Column::CreatedAt)
        .order_by_desc(comments::Column::Id)
        .all(&state.db)
        .await?;
    Ok(json(represent(&state.db, &comments).await?))
}

pub async fn post_comments(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let post_id = id_param(&req, "post_id", "Post")?;
    let post = Posts::find_by_id(post_id)
        .filter(posts::Column::Status.eq(crate::entities::posts::PostStatus::Published))
        .one(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Post"))?;

    let top = Comments::find()
        .filter(comments::Column::PostId.eq(post.id))
        .filter(comments::Column::ParentId.is_null())
        .filter(comments::Column::IsActive.eq(true))
        .order_by_desc(comments::Column::CreatedAt)
        .order_by_desc(comments::Column::Id)
        .all(&state.db)
        .await?;
    let comments = threaded(&state.db, &top).await?;

    Ok(json(json!({
        "post": PostBrief::from(&post),
        "comments_count": comments.len(),
        "comments": comments,
    })))
}

pub async fn replies(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let id = id_param(&req, "id", "Comment")?;
    let parent = active_comment(&state.db, id).await?;

    let replies = active_replies(&state.db, vec![parent.id]).await?;
    let parent_out = represent(&state.db, std::slice::from_ref(&parent)).await?;

    Ok(json(json!({
        "parent_comment": parent_out.into_iter().next(),
        "replies_count": replies.len(),
        "replies": represent(&state.db, &replies).await?,
    })))
}
