use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, Set,
};
use serde_json::json;

use super::{state, FieldErrors};
use crate::auth::{hash_password, verify_password, CurrentUser, TokenKind};
use crate::entities::{comments, posts, prelude::*, users};
use crate::error::{is_unique_violation, ApiError, Result};
use crate::http::{json, json_with_status, FromRequest, Json, Request, Response, StatusCode};
use crate::models::*;

const MIN_PASSWORD_LEN: usize = 8;

async fn profile(db: &DatabaseConnection, user: &users::Model) -> Result<UserProfile> {
    let posts_count = Posts::find()
        .filter(posts::Column::AuthorId.eq(user.id))
        .count(db)
        .await?;
    let comments_count = Comments::find()
        .filter(comments::Column::AuthorId.eq(user.id))
        .filter(comments::Column::IsActive.eq(true))
        .count(db)
        .await?;
    Ok(UserProfile::new(user, posts_count, comments_count))
}

fn check_new_password(errors: &mut FieldErrors, field: &str, password: &str, confirm: &str, confirm_field: &str) {
    if password.chars().count() < MIN_PASSWORD_LEN {
        errors.add(field, "Ensure this field has at least 8 characters.");
    }
    if password != confirm {
        errors.add(confirm_field, "Passwords do not match.");
    }
}

pub async fn register(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let Json(input) = Json::<RegisterInput>::from_request(&mut req).await?;

    let username = input.username.trim().to_string();
    let email = input.email.trim().to_lowercase();

    let mut errors = FieldErrors::default();
    errors.require("username", &username);
    if !email.contains('@') {
        errors.add("email", "Enter a valid email address.");
    }
    check_new_password(&mut errors, "password", &input.password, &input.password_confirm, "password_confirm");
    errors.finish()?;

    let now = Utc::now();
    let inserted = users::ActiveModel {
        username: Set(username),
        email: Set(email),
        password_hash: Set(hash_password(&input.password)?),
        first_name: Set(input.first_name.trim().to_string()),
        last_name: Set(input.last_name.trim().to_string()),
        bio: Set(String::new()),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(&state.db)
    .await;

    let user = match inserted {
        Ok(user) => user,
        Err(err) if is_unique_violation(&err) => {
            return Err(ApiError::Conflict(
                "A user with this username or email already exists".into(),
            ))
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!(user_id = user.id, username = %user.username, "user registered");
    let tokens = state.keys.issue_pair(&user)?;
    Ok(json_with_status(
        StatusCode::Created,
        json!({
            "user": profile(&state.db, &user).await?,
            "access": tokens.access,
            "refresh": tokens.refresh,
            "message": "User registered successfully",
        }),
    ))
}

pub async fn login(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let Json(input) = Json::<LoginInput>::from_request(&mut req).await?;

    let user = Users::find()
        .filter(users::Column::Email.eq(input.email.trim().to_lowercase()))
        .one(&state.db)
        .await?
        .filter(|u| verify_password(&input.password, &u.password_hash))
        .ok_or_else(|| ApiError::Unauthorized("Invalid email or password".into()))?;
    if !user.is_active {
        return Err(ApiError::Unauthorized("User account is disabled".into()));
    }

    let tokens = state.keys.issue_pair(&user)?;
    Ok(json(json!({
        "user": profile(&state.db, &user).await?,
        "access": tokens.access,
        "refresh": tokens.refresh,
        "message": "Login successful",
    })))
}

pub async fn refresh(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let Json(input) = Json::<RefreshInput>::from_request(&mut req).await?;

    let claims = state.keys.verify(&input.refresh, TokenKind::Refresh)?;
    let user = Users::find_by_id(claims.sub)
        .one(&state.db)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| ApiError::Unauthorized("User not found".into()))?;

    Ok(json(json!({ "access": state.keys.issue(&user, TokenKind::Access)? })))
}

pub async fn get_profile(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    Ok(json(profile(&state.db, &user).await?))
}

pub async fn update_profile(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let Json(input) = Json::<ProfileUpdate>::from_request(&mut req).await?;

    let mut active = user.into_active_model();
    if let Some(first_name) = input.first_name {
        active.first_name = Set(first_name.trim().to_string());
    }
    if let Some(last_name) = input.last_name {
        active.last_name = Set(last_name.trim().to_string());
    }
    if let Some(bio) = input.bio {
        active.bio = Set(bio);
    }
    active.updated_at = Set(Utc::now());
    let user = active.update(&state.db).await?;

    Ok(json(profile(&state.db, &user).await?))
}

pub async fn change_password(mut req: Request, _res: Response) -> Result<Response> {
    let state = state(&mut req).await?;
    let CurrentUser(user) = CurrentUser::from_request(&mut req).await?;
    let Json(input) = Json::<ChangePasswordInput>::from_request(&mut req).await?;

    let mut errors = FieldErrors::default();
    if !verify_password(&input.old_password, &user.password_hash) {
        errors.add("old_password", "Old password is incorrect.");
    }
    check_new_password(
        &mut errors,
        "new_password",
        &input.new_password,
        &input.new_password_confirm,
        "new_password_confirm",
    );
    errors.finish()?;

    let user_id = user.id;
    let mut active = user.into_active_model();
    active.password_hash = Set(hash_password(&input.new_password)?);
    active.updated_at = Set(Utc::now());
    active.update(&state.db).await?;

    tracing::info!(user_id, "password changed");
    Ok(json(json!({ "message": "Password changed successfully" })))
}
