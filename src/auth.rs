use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sea_orm::EntityTrait;
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::entities::{prelude::*, users};
use crate::error::{ApiError, Result};
use crate::http::{FromRequest, Request};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i32,
    pub username: String,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// HS256 keys and token lifetimes.
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenKeys {
    pub fn from_config(config: &AuthConfig) -> Self {
        let secret = config.jwt_secret.as_bytes();
        TokenKeys {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            access_ttl: Duration::minutes(config.access_token_minutes),
            refresh_ttl: Duration::days(config.refresh_token_days),
        }
    }

    pub fn issue(&self, user: &users::Model, kind: TokenKind) -> Result<String> {
        let now = Utc::now();
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub: user.id,
            username: user.username.clone(),
            kind,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ApiError::Internal(format!("failed to create token: {e}")))
    }

    pub fn issue_pair(&self, user: &users::Model) -> Result<TokenPair> {
        Ok(TokenPair {
            access: self.issue(user, TokenKind::Access)?,
            refresh: self.issue(user, TokenKind::Refresh)?,
        })
    }

    /// Decodes `token` and checks that it is of the expected kind.
    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims> {
        let claims = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|_| invalid_token())?;
        if claims.kind != kind {
            return Err(invalid_token());
        }
        Ok(claims)
    }
}

fn invalid_token() -> ApiError {
    ApiError::Unauthorized("Given token not valid for any token type".into())
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Internal(format!("failed to hash password: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            tracing::warn!(error = %err, "stored password hash is malformed");
            false
        }
    }
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.header("authorization")?.strip_prefix("Bearer ")
}

async fn load_user(req: &Request, token: &str) -> Result<users::Model> {
    let state = req
        .get_context::<AppState>()
        .ok_or_else(|| ApiError::Internal("application state is not registered".into()))?;
    let claims = state.keys.verify(token, TokenKind::Access)?;

    match Users::find_by_id(claims.sub).one(&state.db).await? {
        Some(user) if user.is_active => Ok(user),
        Some(_) => Err(ApiError::Unauthorized("User is inactive".into())),
        None => Err(ApiError::Unauthorized("User not found".into())),
    }
}

/// The authenticated user; rejects the request with 401 otherwise.
pub struct CurrentUser(pub users::Model);

#[async_trait::async_trait]
impl FromRequest for CurrentUser {
    async fn from_request(req: &mut Request) -> Result<Self> {
        let token = bearer_token(req).ok_or_else(|| {
            ApiError::Unauthorized("Authentication credentials were not provided".into())
        })?;
        load_user(req, token).await.map(CurrentUser)
    }
}

/// The authenticated user when a token is present. A present but invalid
/// token is still rejected.
pub struct OptionalUser(pub Option<users::Model>);

#[async_trait::async_trait]
impl FromRequest for OptionalUser {
    async fn from_request(req: &mut Request) -> Result<Self> {
        match bearer_token(req) {
            Some(token) => load_user(req, token).await.map(|u| OptionalUser(Some(u))),
            None => Ok(OptionalUser(None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> users::Model {
        let now = Utc::now();
        users::Model {
            id: 7,
            username: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            bio: String::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn keys() -> TokenKeys {
        TokenKeys::from_config(&AuthConfig::default())
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("anything", "not-a-hash"));
    }

    #[test]
    fn tokens_carry_kind_and_subject() {
        let keys = keys();
        let pair = keys.issue_pair(&user()).unwrap();

        let claims = keys.verify(&pair.access, TokenKind::Access).unwrap();
        assert_eq!(claims.sub, 7);
        assert_eq!(claims.username, "alice");

        assert!(keys.verify(&pair.refresh, TokenKind::Access).is_err());
        assert!(keys.verify(&pair.refresh, TokenKind::Refresh).is_ok());
    }

    #[test]
    fn foreign_secret_is_rejected() {
        let token = keys().issue(&user(), TokenKind::Access).unwrap();
        let other = TokenKeys::from_config(&AuthConfig {
            jwt_secret: "another-secret-that-is-long-enough-0000".into(),
            ..AuthConfig::default()
        });
        assert!(matches!(
            other.verify(&token, TokenKind::Access),
            Err(ApiError::Unauthorized(_))
        ));
    }
}
