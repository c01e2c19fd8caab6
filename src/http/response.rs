use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Created,
    NoContent,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    Conflict,
    PayloadTooLarge,
    InternalServerError,
    Custom(u16, String),
}

impl StatusCode {
    pub fn as_str(&self) -> String {
        match self {
            StatusCode::Ok => "200 OK".to_string(),
            StatusCode::Created => "201 Created".to_string(),
            StatusCode::NoContent => "204 No Content".to_string(),
            StatusCode::BadRequest => "400 Bad Request".to_string(),
            StatusCode::Unauthorized => "401 Unauthorized".to_string(),
            StatusCode::Forbidden => "403 Forbidden".to_string(),
            StatusCode::NotFound => "404 Not Found".to_string(),
            StatusCode::MethodNotAllowed => "405 Method Not Allowed".to_string(),
            StatusCode::Conflict => "409 Conflict".to_string(),
            StatusCode::PayloadTooLarge => "413 Payload Too Large".to_string(),
            StatusCode::InternalServerError => "500 Internal Server Error".to_string(),
            StatusCode::Custom(code, text) => format!("{code} {text}"),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::NoContent => 204,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::Conflict => 409,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::InternalServerError => 500,
            StatusCode::Custom(code, _) => *code,
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body = text.into().into_bytes();
        self.headers.insert(
            "Content-Type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        );
        self
    }

    /// Replaces the body with `data` serialized as JSON.
    pub fn json(mut self, data: impl serde::Serialize) -> Self {
        self.headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        match serde_json::to_vec(&data) {
            Ok(body) => self.body = body,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize response body");
                self.body = b"{\"error\":\"Failed to serialize JSON\",\"status\":500}".to_vec();
                self.status = StatusCode::InternalServerError;
            }
        }
        self
    }

    /// Status line, headers and body as sent on the wire.
    pub fn to_bytes(&self, keep_alive: bool) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {}\r\n", self.status.as_str());
        for (k, v) in &self.headers {
            if k.eq_ignore_ascii_case("content-length") || k.eq_ignore_ascii_case("connection") {
                continue;
            }
            head.push_str(&format!("{k}: {v}\r\n"));
        }
        if !self.headers.contains_key("Content-Type") {
            head.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        head.push_str(if keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

impl Default for Response {
    fn default() -> Self {
        Response::new(StatusCode::Ok, Vec::new())
    }
}

/// Builds a JSON response with status 200.
pub fn json(data: impl serde::Serialize) -> Response {
    Response::default().json(data)
}

/// Builds a JSON response with an explicit status.
pub fn json_with_status(status: StatusCode, data: impl serde::Serialize) -> Response {
    Response::default().json(data).with_status(status)
}
