use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
    Unknown(String),
}

impl Method {
    pub fn parse(method: &str) -> Self {
        match method {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "OPTIONS" => Method::OPTIONS,
            "PATCH" => Method::PATCH,
            other => Method::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::Unknown(s) => s.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
    Unknown(u8),
}

impl Version {
    pub fn from_minor(minor: u8) -> Self {
        match minor {
            0 => Version::Http10,
            1 => Version::Http11,
            other => Version::Unknown(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Uri {
    pub path: String,
    pub query: HashMap<String, String>,
}

impl Uri {
    pub fn new(path: &str, query: HashMap<String, String>) -> Self {
        Uri {
            path: path.to_string(),
            query,
        }
    }

    /// Splits a request target into its path and decoded query pairs.
    pub fn parse(target: &str) -> Self {
        let (path, query_str) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };

        let mut query = HashMap::new();
        for pair in query_str.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            query.insert(decode_component(key), decode_component(value));
        }

        Uri::new(path, query)
    }
}

/// Percent-decodes a query component, treating `+` as a space.
fn decode_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Typed per-request storage, filled by the server and by extractors.
#[derive(Clone, Default)]
pub struct Context {
    data: Arc<RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync + Clone>(&self, value: T) {
        if let Ok(mut data) = self.data.write() {
            data.insert(TypeId::of::<T>(), Box::new(value));
        }
    }

    pub fn get<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        let data = self.data.read().ok()?;
        data.get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let items = self.data.read().map(|d| d.len()).unwrap_or_default();
        f.debug_struct("Context").field("items", &items).finish()
    }
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    /// Header names are stored lowercased.
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
    pub remote_addr: Option<std::net::SocketAddr>,
    pub params: HashMap<String, String>,
    pub context: Context,
}

impl Request {
    pub fn new(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HashMap<String, Vec<String>>,
        body: Vec<u8>,
        remote_addr: Option<std::net::SocketAddr>,
    ) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();

        Request {
            method,
            uri,
            version,
            headers,
            body,
            remote_addr,
            params: HashMap::new(),
            context: Context::new(),
        }
    }

    pub fn set_context<T: Any + Send + Sync + Clone>(&mut self, value: T) {
        self.context.insert(value);
    }

    pub fn get_context<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.context.get()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Route parameter parsed into `T`; `None` when absent or malformed.
    pub fn param_as<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.params.get(name)?.parse().ok()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())?
            .first()
            .map(String::as_str)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.uri.query.get(name).map(String::as_str)
    }

    pub fn path(&self) -> &str {
        &self.uri.path
    }
}
