//! Built-in path-prefix reverse proxy
//!
//! Two listeners share one [`RoutingTable`]:
//! - [`ProxyServer`] forwards public traffic to the target of the longest
//!   matching route prefix.
//! - [`ProxyApiServer`] exposes the routing table over REST
//!   (`GET /api/routes`, `POST|DELETE /api/routes{prefix}`) behind a token.

use crate::error::json_error_response;
use crate::pool::{upstream_uri, ConnectionPool, PoolConfig};
use crate::routes::{normalize_prefix, Route, RoutingTable};
use crate::token::constant_time_compare;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const ROUTES_PATH: &str = "/api/routes";

type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn boxed_error(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    json_error_response(status, message).map(|b| b.map_err(|never| match never {}).boxed())
}

/// The public-facing forwarding proxy
pub struct ProxyServer {
    bind_addr: SocketAddr,
    routes: Arc<RoutingTable>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        routes: Arc<RoutingTable>,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, routes, request_timeout, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        routes: Arc<RoutingTable>,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            routes,
            pool: Arc::new(ConnectionPool::new(pool_config)),
            request_timeout,
            shutdown_rx,
        }
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = Arc::clone(&self.routes);
                            let pool = Arc::clone(&self.pool);
                            let request_timeout = self.request_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, routes, pool, request_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let stats = self.pool.stats();
                        info!(
                            requests = stats.get_total_requests(),
                            failed = stats.get_failed_requests(),
                            "Proxy server shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    routes: Arc<RoutingTable>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, routes, pool, addr, request_timeout).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    routes: Arc<RoutingTable>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
    request_timeout: Duration,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let path = req.uri().path().to_string();
    debug!(method = %req.method(), path, request_id, "Incoming request");

    let (prefix, target) = match routes.lookup(&path) {
        Some(found) => found,
        None => {
            return Ok(boxed_error(StatusCode::NOT_FOUND, format!("No route for {}", path)));
        }
    };

    routes.touch(&prefix);

    if is_upgrade_request(&req) {
        return handle_upgrade(req, prefix, target, request_id).await;
    }

    match tokio::time::timeout(request_timeout, pool.send_request(req, &target)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(prefix, target, error = %e, "Failed to forward request");
            Ok(boxed_error(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"))
        }
        Err(_) => {
            warn!(
                prefix,
                target,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(boxed_error(
                StatusCode::GATEWAY_TIMEOUT,
                format!("Request timed out after {} seconds", request_timeout.as_secs()),
            ))
        }
    }
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Forward bytes bidirectionally between client and backend connections
async fn forward_bidirectional(client: Upgraded, backend: TcpStream, prefix: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                prefix,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(prefix, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Raw HTTP/1.1 upgrade request for the backend, with `Host` rewritten
fn build_upgrade_request<B>(req: &Request<B>, authority: &str, path_and_query: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", authority));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the backend's response head to check for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    prefix: String,
    target: String,
    request_id: String,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri = match upstream_uri(&target, path_and_query) {
        Ok(uri) => uri,
        Err(e) => {
            error!(prefix, target, error = %e, "Cannot upgrade to route target");
            return Ok(boxed_error(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"));
        }
    };
    let authority = uri.authority().map(|a| a.to_string()).unwrap_or_default();
    let upstream_path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let raw_request = build_upgrade_request(&req, &authority, upstream_path);

    let mut backend_stream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(prefix, target, error = %e, "Failed to connect to backend for upgrade");
            return Ok(boxed_error(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(prefix, error = %e, "Failed to send upgrade request to backend");
        return Ok(boxed_error(StatusCode::BAD_GATEWAY, "Failed to send upgrade request"));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match backend_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(prefix, "Backend closed connection before responding to upgrade");
            return Ok(boxed_error(StatusCode::BAD_GATEWAY, "Backend closed connection"));
        }
        Err(e) => {
            error!(prefix, error = %e, "Failed to read upgrade response from backend");
            return Ok(boxed_error(StatusCode::BAD_GATEWAY, "Failed to read backend response"));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => {
            error!(prefix, "Failed to parse backend upgrade response");
            return Ok(boxed_error(StatusCode::BAD_GATEWAY, "Invalid upgrade response from backend"));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(prefix, status = %status, "Backend rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, &prefix, &request_id).await;
            }
            Err(e) => {
                error!(prefix, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

/// REST API over the routing table
pub struct ProxyApiServer {
    bind_addr: SocketAddr,
    routes: Arc<RoutingTable>,
    auth_token: Arc<str>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        routes: Arc<RoutingTable>,
        auth_token: &str,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            routes,
            auth_token: Arc::from(auth_token),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = Arc::clone(&self.routes);
                            let auth_token = Arc::clone(&self.auth_token);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let routes = Arc::clone(&routes);
                                    let auth_token = Arc::clone(&auth_token);
                                    async move { handle_api_request(req, routes, &auth_token).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Proxy API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept proxy API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Accepts `Authorization: token X` and `Authorization: Bearer X`
fn check_api_auth<B>(req: &Request<B>, auth_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| {
            auth.strip_prefix("token ")
                .or_else(|| auth.strip_prefix("Bearer "))
        })
        .map(|token| constant_time_compare(token.trim().as_bytes(), auth_token.as_bytes()))
        .unwrap_or(false)
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("valid response")
}

async fn handle_api_request(
    req: Request<Incoming>,
    routes: Arc<RoutingTable>,
    auth_token: &str,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if !check_api_auth(&req, auth_token) {
        return Ok(json_error_response(StatusCode::FORBIDDEN, "Forbidden"));
    }

    let path = req.uri().path().to_string();
    let prefix = match path.strip_prefix(ROUTES_PATH) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => normalize_prefix(rest),
        _ => return Ok(json_error_response(StatusCode::NOT_FOUND, "Not Found")),
    };
    let method = req.method().clone();

    match method {
        Method::GET => {
            let body = match serde_json::to_vec(&routes.snapshot()) {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "Failed to serialize routes");
                    return Ok(json_error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"));
                }
            };
            Ok(json_response(StatusCode::OK, body))
        }
        Method::POST => {
            let body = req.collect().await?.to_bytes();
            let route: Route = match serde_json::from_slice(&body) {
                Ok(route) => route,
                Err(e) => {
                    return Ok(json_error_response(
                        StatusCode::BAD_REQUEST,
                        format!("Invalid route: {}", e),
                    ));
                }
            };
            if upstream_uri(&route.target, "/").is_err() {
                return Ok(json_error_response(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid target: {}", route.target),
                ));
            }
            info!(prefix, target = %route.target, "Adding route");
            routes.insert(&prefix, route);
            Ok(empty_response(StatusCode::CREATED))
        }
        Method::DELETE => {
            if routes.remove(&prefix) {
                info!(prefix, "Deleted route");
            }
            Ok(empty_response(StatusCode::NO_CONTENT))
        }
        _ => Ok(json_error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")),
    }
}
