use bytes::{Buf, BytesMut};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{
    AsyncHandler, Context, Flow, Method, Middleware, Request, Response, RouteMatch, Router,
    StatusCode, Uri, Version,
};

const READ_CHUNK: usize = 8192;
const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

type StateInit = Arc<dyn Fn(&Context) + Send + Sync>;

pub struct Server {
    pub(crate) router: Router,
    pub(crate) middlewares: Vec<Middleware>,
    state: Vec<StateInit>,
    prefix: String,
    cors: bool,
}

impl Server {
    pub fn new() -> Self {
        Server {
            router: Router::new(),
            middlewares: Vec::new(),
            state: Vec::new(),
            prefix: String::new(),
            cors: false,
        }
    }

    /// Global prefix for every route registered afterwards.
    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim_end_matches('/').to_string();
        self
    }

    /// Makes a clone of `value` available to every request's `Context`.
    pub fn with_state<T>(mut self, value: T) -> Self
    where
        T: Any + Clone + Send + Sync,
    {
        self.state
            .push(Arc::new(move |ctx: &Context| ctx.insert(value.clone())));
        self
    }

    /// Adds permissive CORS headers to every response and answers preflights.
    pub fn cors(mut self) -> Self {
        self.cors = true;
        self.middlewares.insert(0, cors_preflight);
        self
    }

    pub fn route<H>(mut self, method: &str, path: &str, handler: H) -> Self
    where
        H: AsyncHandler + 'static,
    {
        let full_path = format!("{}{}", self.prefix, path);
        self.router.add_route(method, &full_path, Box::new(handler));
        self
    }

    pub fn get<H>(self, path: &str, handler: H) -> Self
    where
        H: AsyncHandler + 'static,
    {
        self.route("GET", path, handler)
    }

    pub fn post<H>(self, path: &str, handler: H) -> Self
    where
        H: AsyncHandler + 'static,
    {
        self.route("POST", path, handler)
    }

    pub fn put<H>(self, path: &str, handler: H) -> Self
    where
        H: AsyncHandler + 'static,
    {
        self.route("PUT", path, handler)
    }

    pub fn patch<H>(self, path: &str, handler: H) -> Self
    where
        H: AsyncHandler + 'static,
    {
        self.route("PATCH", path, handler)
    }

    pub fn delete<H>(self, path: &str, handler: H) -> Self
    where
        H: AsyncHandler + 'static,
    {
        self.route("DELETE", path, handler)
    }

    pub fn middleware(mut self, mw: Middleware) -> Self {
        self.middlewares.push(mw);
        self
    }

    pub(crate) fn into_service(self) -> Service {
        Service {
            router: self.router,
            middlewares: self.middlewares,
            state: self.state,
            cors: self.cors,
        }
    }

    /// Serves until Ctrl-C.
    pub async fn listen(self, addr: &str) -> std::io::Result<()> {
        self.listen_until(addr, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serves until `shutdown` resolves. In-flight connections finish on
    /// their own tasks.
    pub async fn listen_until<F>(self, addr: &str, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = bind(addr)?;
        tracing::info!(%addr, "listening");

        let service = Arc::new(self.into_service());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let _ = socket.set_nodelay(true);
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(socket, remote_addr, service).await {
                            tracing::warn!(%remote_addr, error = %err, "connection error");
                        }
                    });
                }
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received, no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

fn bind(addr: &str) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket_addr: SocketAddr = addr
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let domain = if socket_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket_addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}

/// Routing and middleware, shared by the socket loop and the test client.
pub(crate) struct Service {
    router: Router,
    middlewares: Vec<Middleware>,
    state: Vec<StateInit>,
    cors: bool,
}

impl Service {
    pub(crate) async fn dispatch(&self, request: Request) -> Response {
        let started = Instant::now();
        let method = request.method.clone();
        let path = request.uri.path.clone();

        for init in &self.state {
            init(&request.context);
        }

        let mut request = Some(request);
        let mut response = Response::default();
        for mw in &self.middlewares {
            let Some(req) = request.take() else { break };
            match mw(req, response) {
                Flow::Stop(res) => {
                    response = res;
                    break;
                }
                Flow::Next(req, res) => {
                    request = Some(req);
                    response = res;
                }
            }
        }

        if let Some(mut request) = request {
            response = match self.router.find(&request.method, &path) {
                RouteMatch::Found(handler, params) => {
                    request.params = params;
                    handler.call(request, response).await
                }
                RouteMatch::MethodNotAllowed => {
                    error_response(StatusCode::MethodNotAllowed, "Method not allowed")
                }
                RouteMatch::NotFound => error_response(StatusCode::NotFound, "Not found"),
            };
        }

        if self.cors {
            response = with_cors_headers(response);
        }

        tracing::debug!(
            method = method.as_str(),
            %path,
            status = response.status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request"
        );
        response
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let code = status.code();
    Response::default()
        .json(serde_json::json!({ "error": message, "status": code }))
        .with_status(status)
}

fn cors_preflight(req: Request, res: Response) -> Flow {
    if req.method == Method::OPTIONS {
        Flow::Stop(res.with_status(StatusCode::NoContent))
    } else {
        Flow::Next(req, res)
    }
}

fn with_cors_headers(res: Response) -> Response {
    res.with_header("Access-Control-Allow-Origin", "*")
        .with_header(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, PATCH, DELETE, OPTIONS",
        )
        .with_header(
            "Access-Control-Allow-Headers",
            "Authorization, Content-Type, X-Webhook-Secret",
        )
}

/// Head of a request whose body has not been read yet.
struct Head {
    method: Method,
    target: String,
    version: Version,
    headers: HashMap<String, Vec<String>>,
    content_length: usize,
    keep_alive: bool,
}

enum Parsed {
    Complete(Head, usize),
    Partial,
    BadLength,
}

fn parse_head(buf: &[u8]) -> Result<Parsed, httparse::Error> {
    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut raw_headers);

    let header_len = match req.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(Parsed::Partial),
    };

    let version = Version::from_minor(req.version.unwrap_or(1));
    let mut keep_alive = version == Version::Http11;
    let mut content_length = 0;
    let mut headers: HashMap<String, Vec<String>> = HashMap::with_capacity(req.headers.len());

    for header in req.headers.iter() {
        let value = String::from_utf8_lossy(header.value).into_owned();
        if header.name.eq_ignore_ascii_case("content-length") {
            content_length = match value.trim().parse() {
                Ok(len) => len,
                Err(_) => return Ok(Parsed::BadLength),
            };
        } else if header.name.eq_ignore_ascii_case("connection") {
            keep_alive = value.eq_ignore_ascii_case("keep-alive");
        }
        headers.entry(header.name.to_string()).or_default().push(value);
    }

    let head = Head {
        method: Method::parse(req.method.unwrap_or("GET")),
        target: req.path.unwrap_or("/").to_string(),
        version,
        headers,
        content_length,
        keep_alive,
    };
    Ok(Parsed::Complete(head, header_len))
}

async fn write_response(
    socket: &mut TcpStream,
    response: &Response,
    keep_alive: bool,
) -> std::io::Result<()> {
    socket.write_all(&response.to_bytes(keep_alive)).await?;
    socket.flush().await
}

async fn handle_connection(
    mut socket: TcpStream,
    remote_addr: SocketAddr,
    service: Arc<Service>,
) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        let (head, header_len) = loop {
            match parse_head(&buf) {
                Ok(Parsed::Complete(head, len)) => break (head, len),
                Ok(Parsed::Partial) => {
                    if buf.len() > MAX_HEADER_BYTES {
                        let res = error_response(StatusCode::BadRequest, "Request header too large");
                        return write_response(&mut socket, &res, false).await;
                    }
                    if socket.read_buf(&mut buf).await? == 0 {
                        return Ok(());
                    }
                }
                Ok(Parsed::BadLength) => {
                    tracing::debug!(%remote_addr, "malformed content-length");
                    let res = error_response(StatusCode::BadRequest, "Malformed request");
                    return write_response(&mut socket, &res, false).await;
                }
                Err(err) => {
                    tracing::debug!(%remote_addr, error = %err, "malformed request");
                    let res = error_response(StatusCode::BadRequest, "Malformed request");
                    return write_response(&mut socket, &res, false).await;
                }
            }
        };

        if head.content_length > MAX_BODY_BYTES {
            let res = error_response(StatusCode::PayloadTooLarge, "Request body too large");
            return write_response(&mut socket, &res, false).await;
        }

        buf.advance(header_len);
        while buf.len() < head.content_length {
            if socket.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
        let body = buf.split_to(head.content_length).to_vec();

        let request = Request::new(
            head.method,
            Uri::parse(&head.target),
            head.version,
            head.headers,
            body,
            Some(remote_addr),
        );
        let response = service.dispatch(request).await;
        write_response(&mut socket, &response, head.keep_alive).await?;

        if !head.keep_alive {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_head_reads_length_and_connection() {
        let raw = b"POST /api/v1/posts HTTP/1.1\r\nHost: x\r\nContent-Length: 12\r\nConnection: close\r\n\r\n{\"a\":1}";
        match parse_head(raw).unwrap() {
            Parsed::Complete(head, len) => {
                assert_eq!(head.method, Method::POST);
                assert_eq!(head.target, "/api/v1/posts");
                assert_eq!(head.content_length, 12);
                assert!(!head.keep_alive);
                assert_eq!(&raw[len..], b"{\"a\":1}");
            }
            _ => panic!("expected a complete head"),
        }
    }

    #[test]
    fn parse_head_waits_for_more_bytes() {
        assert!(matches!(
            parse_head(b"GET /health HTTP/1.1\r\nHost"),
            Ok(Parsed::Partial)
        ));
    }

    #[test]
    fn http10_defaults_to_close() {
        match parse_head(b"GET / HTTP/1.0\r\n\r\n").unwrap() {
            Parsed::Complete(head, _) => assert!(!head.keep_alive),
            _ => panic!("expected a complete head"),
        }
    }

    #[test]
    fn unreadable_content_length_is_rejected() {
        let raw = b"POST /api/v1/posts HTTP/1.1\r\nHost: x\r\nContent-Length: abc\r\n\r\n{}";
        assert!(matches!(parse_head(raw), Ok(Parsed::BadLength)));
        let raw = b"POST / HTTP/1.1\r\nContent-Length: -4\r\n\r\n";
        assert!(matches!(parse_head(raw), Ok(Parsed::BadLength)));
    }

    #[tokio::test]
    async fn bad_content_length_gets_400() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = Server::new().get("/hello", hello);
        let task = tokio::spawn(async move {
            server
                .listen_until("127.0.0.1:38418", async {
                    let _ = rx.await;
                })
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect("127.0.0.1:38418").await.unwrap();
        stream
            .write_all(b"POST /hello HTTP/1.1\r\nHost: x\r\nContent-Length: ten\r\n\r\n")
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.contains("Malformed request"));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    async fn hello(_req: Request, res: Response) -> Response {
        res.text("hi")
    }

    #[tokio::test]
    async fn serves_over_tcp_until_shutdown() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = Server::new().cors().get("/hello", hello);
        let task = tokio::spawn(async move {
            server
                .listen_until("127.0.0.1:38417", async {
                    let _ = rx.await;
                })
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect("127.0.0.1:38417").await.unwrap();
        stream
            .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Access-Control-Allow-Origin: *"));
        assert!(out.ends_with("hi"));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
