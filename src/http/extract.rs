use super::{Request, Response, StatusCode};
use crate::error::{ApiError, Result};

/// Pulls a typed value out of a request.
#[async_trait::async_trait]
pub trait FromRequest: Sized {
    async fn from_request(req: &mut Request) -> Result<Self>;
}

/// JSON request body.
pub struct Json<T>(pub T);

#[async_trait::async_trait]
impl<T> FromRequest for Json<T>
where
    T: serde::de::DeserializeOwned + Send,
{
    async fn from_request(req: &mut Request) -> Result<Self> {
        if req.body.is_empty() {
            return Err(ApiError::BadRequest("Request body is required".into()));
        }
        let value = serde_json::from_slice(&req.body)
            .map_err(|e| ApiError::BadRequest(format!("Failed to parse JSON: {e}")))?;
        Ok(Json(value))
    }
}

/// Query string deserialized through its string map.
pub struct Query<T>(pub T);

#[async_trait::async_trait]
impl<T> FromRequest for Query<T>
where
    T: serde::de::DeserializeOwned + Send,
{
    async fn from_request(req: &mut Request) -> Result<Self> {
        let value = serde_json::from_value(serde_json::json!(req.uri.query))
            .map_err(|e| ApiError::BadRequest(format!("Failed to parse query: {e}")))?;
        Ok(Query(value))
    }
}

/// Shared value registered with `Server::with_state`.
pub struct State<T>(pub T);

#[async_trait::async_trait]
impl<T> FromRequest for State<T>
where
    T: std::any::Any + Clone + Send + Sync,
{
    async fn from_request(req: &mut Request) -> Result<Self> {
        req.get_context::<T>()
            .map(State)
            .ok_or_else(|| ApiError::Internal("application state is not registered".into()))
    }
}

pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response {
        self
    }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response {
        Response::new(StatusCode::Ok, self.as_bytes())
            .with_header("Content-Type", "text/plain; charset=utf-8")
    }
}

impl<T: serde::Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        Response::default().json(self.0)
    }
}

impl<T: IntoResponse> IntoResponse for Result<T> {
    fn into_response(self) -> Response {
        match self {
            Ok(value) => value.into_response(),
            Err(err) => err.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, Uri, Version};
    use std::collections::HashMap;

    fn request(target: &str, body: &[u8]) -> Request {
        Request::new(
            Method::POST,
            Uri::parse(target),
            Version::Http11,
            HashMap::new(),
            body.to_vec(),
            None,
        )
    }

    #[derive(serde::Deserialize)]
    struct Input {
        title: String,
    }

    #[derive(serde::Deserialize)]
    struct Params {
        ordering: Option<String>,
    }

    #[tokio::test]
    async fn json_extractor_parses_body() {
        let mut req = request("/", br#"{"title": "Hello"}"#);
        let Json(input) = Json::<Input>::from_request(&mut req).await.unwrap();
        assert_eq!(input.title, "Hello");
    }

    #[tokio::test]
    async fn json_extractor_rejects_empty_and_invalid_bodies() {
        let mut empty = request("/", b"");
        assert!(matches!(
            Json::<Input>::from_request(&mut empty).await,
            Err(ApiError::BadRequest(_))
        ));

        let mut invalid = request("/", b"{not json");
        assert!(matches!(
            Json::<Input>::from_request(&mut invalid).await,
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn query_extractor_handles_missing_keys() {
        let mut req = request("/posts?ordering=title", b"");
        let Query(params) = Query::<Params>::from_request(&mut req).await.unwrap();
        assert_eq!(params.ordering.as_deref(), Some("title"));

        let mut bare = request("/posts", b"");
        let Query(params) = Query::<Params>::from_request(&mut bare).await.unwrap();
        assert!(params.ordering.is_none());
    }
}
