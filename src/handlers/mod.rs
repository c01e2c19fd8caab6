pub mod accounts;
pub mod categories;
pub mod comments;
pub mod payments;
pub mod posts;
pub mod subscriptions;

use crate::error::{ApiError, Result};
use crate::http::{json, FromRequest, Request, Response, State};
use crate::state::AppState;

pub async fn health(_req: Request, _res: Response) -> Response {
    json(serde_json::json!({ "status": "ok" }))
}

pub(crate) async fn state(req: &mut Request) -> Result<AppState> {
    let State(state) = State::<AppState>::from_request(req).await?;
    Ok(state)
}

/// Route parameter parsed as an id; malformed ids are not found.
pub(crate) fn id_param(req: &Request, name: &str, what: &str) -> Result<i32> {
    req.param_as(name).ok_or_else(|| ApiError::not_found(what))
}

/// Collects per-field messages into one validation error.
#[derive(Default)]
pub(crate) struct FieldErrors(serde_json::Map<String, serde_json::Value>);

impl FieldErrors {
    pub fn add(&mut self, field: &str, message: &str) {
        let entry = self
            .0
            .entry(field.to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if let Some(list) = entry.as_array_mut() {
            list.push(message.into());
        }
    }

    pub fn require(&mut self, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.add(field, "This field may not be blank.");
        }
    }

    pub fn finish(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(serde_json::Value::Object(self.0)))
        }
    }
}
