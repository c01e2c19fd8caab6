use crate::http::{Response, StatusCode};
use sea_orm::{DbErr, SqlErr};

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    /// Field-level input problems, rendered as `{"field": ["message"]}`.
    #[error("validation failed")]
    Validation(serde_json::Value),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(what: &str) -> Self {
        ApiError::NotFound(format!("{what} not found"))
    }

    /// Single-field validation error.
    pub fn field(field: &str, message: &str) -> Self {
        ApiError::Validation(serde_json::json!({ field: [message] }))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Validation(_) | ApiError::Json(_) => {
                StatusCode::BadRequest
            }
            ApiError::Unauthorized(_) => StatusCode::Unauthorized,
            ApiError::Forbidden(_) => StatusCode::Forbidden,
            ApiError::NotFound(_) => StatusCode::NotFound,
            ApiError::Conflict(_) => StatusCode::Conflict,
            ApiError::Database(DbErr::RecordNotFound(_)) => StatusCode::NotFound,
            ApiError::Database(err) if is_unique_violation(err) => StatusCode::Conflict,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::InternalServerError,
        }
    }

    pub fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            ApiError::Validation(fields) => serde_json::json!({
                "error": "Validation failed",
                "fields": fields,
                "status": status.code(),
            }),
            ApiError::Database(err) if status == StatusCode::InternalServerError => {
                tracing::error!(error = %err, "database failure");
                serde_json::json!({
                    "error": "Internal database error",
                    "status": status.code(),
                })
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal failure");
                serde_json::json!({
                    "error": msg,
                    "status": status.code(),
                })
            }
            other => serde_json::json!({
                "error": other.to_string(),
                "status": status.code(),
            }),
        };

        Response::default().json(body).with_status(status)
    }
}

pub fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(res: &Response) -> serde_json::Value {
        serde_json::from_slice(&res.body).unwrap()
    }

    #[test]
    fn forbidden_keeps_message() {
        let res = ApiError::Forbidden("Active subscription required to pin posts".into())
            .into_response();
        assert_eq!(res.status, StatusCode::Forbidden);
        assert_eq!(
            body(&res)["error"],
            "Active subscription required to pin posts"
        );
        assert_eq!(body(&res)["status"], 403);
    }

    #[test]
    fn record_not_found_maps_to_404() {
        let err = ApiError::from(DbErr::RecordNotFound("post".into()));
        assert_eq!(err.status(), StatusCode::NotFound);
    }

    #[test]
    fn validation_lists_fields() {
        let res = ApiError::field("password_confirm", "Passwords do not match.").into_response();
        assert_eq!(res.status, StatusCode::BadRequest);
        assert_eq!(
            body(&res)["fields"]["password_confirm"][0],
            "Passwords do not match."
        );
    }
}
