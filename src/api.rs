//! Hub HTTP server: the REST control API and the login/logout surface
//!
//! Every request is authenticated by an API token (`Authorization: token
//! ...` or `Bearer ...`) or by the signed hub cookie. Cookie-authenticated
//! API requests must carry a `Referer` on the hub's own host and prefix,
//! otherwise the cookie is ignored. Handlers state their access rule with
//! [`require`] before doing anything else.

use crate::auth::Credentials;
use crate::error::{HubError, HubResult};
use crate::hub::{CookieGrant, Hub, OpStatus, Principal, HUB_COOKIE_NAME};
use crate::user::UserModel;
use crate::utils::url_path_join;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_SECURITY_POLICY, CONTENT_TYPE, COOKIE, HOST, LOCATION, REFERER,
    SET_COOKIE,
};
use hyper::http::request::Parts;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

type ApiResponse = Response<Full<Bytes>>;

const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// What `POST /shutdown` asks the hub process to tear down
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShutdownRequest {
    pub servers: bool,
    pub proxy: bool,
}

impl Default for ShutdownRequest {
    fn default() -> Self {
        Self {
            servers: true,
            proxy: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkCreate {
    usernames: Vec<String>,
    #[serde(default)]
    admin: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct UserCreate {
    #[serde(default)]
    admin: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct UserPatch {
    admin: Option<bool>,
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    #[serde(rename = "Authentication")]
    authentication: String,
}

/// Access rule checked at the top of each API operation
#[derive(Debug, Clone, Copy)]
pub enum AuthCondition<'a> {
    Authenticated,
    Admin,
    /// An admin, or the named user acting on itself
    AdminOrSelf(&'a str),
}

/// Check `principal` against `condition`
pub fn require<'p>(principal: &'p Option<Principal>, condition: AuthCondition<'_>) -> HubResult<&'p Principal> {
    let Some(principal) = principal.as_ref() else {
        return Err(HubError::AuthFailure("Authentication required".to_string()));
    };
    let allowed = match condition {
        AuthCondition::Authenticated => true,
        AuthCondition::Admin => principal.is_admin(),
        AuthCondition::AdminOrSelf(name) => principal.is_admin() || principal.user_name() == Some(name),
    };
    if allowed {
        Ok(principal)
    } else {
        Err(HubError::AuthFailure("Permission denied".to_string()))
    }
}

fn user_principal(model: UserModel) -> Principal {
    Principal::User {
        name: model.name,
        admin: model.admin,
    }
}

/// Token from `Authorization: token <t>`, `token: <t>` or `Bearer <t>`
fn request_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = auth.split_once([' ', ':'])?;
    if !scheme.eq_ignore_ascii_case("token") && !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim_start_matches(':').trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
}

fn set_cookie(grant: &CookieGrant) -> String {
    if grant.value.is_empty() {
        format!("{}=; Path={}; Max-Age=0; HttpOnly", grant.name, grant.path)
    } else {
        format!("{}={}; Path={}; HttpOnly; SameSite=Lax", grant.name, grant.value, grant.path)
    }
}

fn invalid_json() -> HubError {
    HubError::InvalidInput("Invalid JSON in body of request".to_string())
}

/// Parse a JSON body; an empty body yields the default
fn json_body<T: DeserializeOwned + Default>(body: &Bytes) -> HubResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        debug!(error = %e, "Bad JSON body");
        invalid_json()
    })
}

fn form_decode(value: &str) -> String {
    let value = value.replace('+', " ");
    urlencoding::decode(&value)
        .map(|v| v.into_owned())
        .unwrap_or(value)
}

fn credentials_from_body(headers: &HeaderMap, body: &Bytes) -> HubResult<Credentials> {
    let is_form = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));

    if !is_form {
        return serde_json::from_slice(body).map_err(|_| invalid_json());
    }

    let form = String::from_utf8_lossy(body);
    let mut credentials = Credentials {
        username: String::new(),
        password: String::new(),
    };
    for pair in form.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match form_decode(key).as_str() {
            "username" => credentials.username = form_decode(value),
            "password" => credentials.password = form_decode(value),
            _ => {}
        }
    }
    Ok(credentials)
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> ApiResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}

fn json_model<T: Serialize>(status: StatusCode, model: &T) -> HubResult<ApiResponse> {
    let body = serde_json::to_string(model).map_err(anyhow::Error::from)?;
    Ok(json_response(status, body))
}

fn empty_response(status: StatusCode) -> ApiResponse {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("valid response")
}

fn redirect(location: &str, cookies: &[CookieGrant]) -> ApiResponse {
    let mut builder = Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location);
    for grant in cookies {
        builder = builder.header(SET_COOKIE, set_cookie(grant));
    }
    builder.body(Full::new(Bytes::new())).expect("valid response")
}

fn options_response() -> ApiResponse {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Headers", "accept, content-type, authorization")
        .header("Access-Control-Allow-Methods", "GET, POST, PATCH, DELETE, OPTIONS")
        .body(Full::new(Bytes::new()))
        .expect("valid response")
}

fn not_found() -> HubError {
    HubError::NotFound("Not found".to_string())
}

/// The hub's HTTP server
pub struct HubApi {
    hub: Arc<Hub>,
    bind_addr: SocketAddr,
    csp: HeaderValue,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_requests: mpsc::UnboundedSender<ShutdownRequest>,
}

impl HubApi {
    pub fn new(
        hub: Arc<Hub>,
        bind_addr: SocketAddr,
        shutdown_rx: watch::Receiver<bool>,
        shutdown_requests: mpsc::UnboundedSender<ShutdownRequest>,
    ) -> Self {
        let report_uri = url_path_join(&[hub.base_url(), "security/csp-report"]);
        let csp = HeaderValue::from_str(&format!("frame-ancestors 'self'; report-uri {}", report_uri))
            .unwrap_or_else(|_| HeaderValue::from_static("frame-ancestors 'self'"));

        Self {
            hub,
            bind_addr,
            csp,
            shutdown_rx,
            shutdown_requests,
        }
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, base_url = %self.hub.base_url(), "Hub API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream).await {
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
                        info!("Hub API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<ApiResponse, hyper::Error> {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(self.respond(&parts, body).await)
    }

    /// Route one request, turning errors into `{status, message}` JSON
    pub async fn respond(&self, parts: &Parts, body: Bytes) -> ApiResponse {
        let method = &parts.method;
        let path = parts.uri.path();
        debug!(%method, path, "Hub request");

        let mut response = match self.route(parts, &body).await {
            Ok(response) => response,
            Err(e) => {
                match e {
                    HubError::Internal(ref inner) => {
                        error!(%method, path, error = %format!("{:#}", inner), "Request failed")
                    }
                    HubError::AuthFailure(_) => warn!(%method, path, error = %e, "Request denied"),
                    _ => debug!(%method, path, kind = e.kind(), error = %e, "Request rejected"),
                }
                e.to_response()
            }
        };

        response
            .headers_mut()
            .insert(CONTENT_SECURITY_POLICY, self.csp.clone());
        response
    }

    async fn route(&self, parts: &Parts, body: &Bytes) -> HubResult<ApiResponse> {
        let path = parts.uri.path();
        if path == "/" {
            return Ok(self.home(parts));
        }

        let base = self.hub.base_url();
        let rest = match path.strip_prefix(base) {
            Some(rest) => rest,
            None if path == base.trim_end_matches('/') => "",
            None => return Err(not_found()),
        };

        if let Some(api_path) = rest.strip_prefix("api") {
            if api_path.is_empty() || api_path.starts_with('/') {
                return self.route_api(parts, api_path, body).await;
            }
        }

        match (parts.method.clone(), rest.trim_end_matches('/')) {
            (Method::GET, "") | (Method::GET, "home") => Ok(self.home(parts)),
            (Method::GET, "login") => Ok(self.login_page(parts)),
            (Method::POST, "login") => self.login(parts, body).await,
            (Method::GET, "logout") => self.logout(parts),
            (Method::POST, "security/csp-report") => {
                warn!(report = %String::from_utf8_lossy(body), "Content security violation");
                Ok(empty_response(StatusCode::NO_CONTENT))
            }
            _ => Err(not_found()),
        }
    }

    /// User behind the hub cookie, without the referer check
    fn cookie_user(&self, headers: &HeaderMap) -> Option<UserModel> {
        let value = cookie_value(headers, HUB_COOKIE_NAME)?;
        self.hub.user_for_cookie(HUB_COOKIE_NAME, &value)
    }

    /// The `Referer` must start with `{Host}{base_url}`, scheme ignored.
    /// Behind the proxy the client's host arrives as `X-Forwarded-Host`.
    fn referer_allowed(&self, headers: &HeaderMap) -> bool {
        let host = headers
            .get(X_FORWARDED_HOST)
            .or_else(|| headers.get(HOST))
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let Some(referer) = headers.get(REFERER).and_then(|v| v.to_str().ok()) else {
            warn!("Blocking cookie access from API request without Referer");
            return false;
        };

        let referer = referer.split_once("://").map(|(_, rest)| rest).unwrap_or(referer);
        let expected = format!("{}{}", host, self.hub.base_url());
        if host.is_empty() || !referer.starts_with(&expected) {
            warn!(referer, expected = %expected, "Blocking cross-site API request");
            return false;
        }
        true
    }

    fn api_principal(&self, headers: &HeaderMap) -> HubResult<Option<Principal>> {
        if let Some(token) = request_token(headers) {
            return self.hub.user_for_token(&token);
        }
        if cookie_value(headers, HUB_COOKIE_NAME).is_none() || !self.referer_allowed(headers) {
            return Ok(None);
        }
        Ok(self.cookie_user(headers).map(user_principal))
    }

    async fn route_api(&self, parts: &Parts, api_path: &str, body: &Bytes) -> HubResult<ApiResponse> {
        if parts.method == Method::OPTIONS {
            return Ok(options_response());
        }

        let segments: Vec<String> = api_path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                urlencoding::decode(s)
                    .map(|s| s.into_owned())
                    .map_err(|_| HubError::InvalidInput("Invalid URL encoding".to_string()))
            })
            .collect::<HubResult<_>>()?;
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        if parts.method == Method::POST && segments == ["authorizations", "token"] {
            return self.token_login(body).await;
        }
        if parts.method == Method::GET && segments.is_empty() {
            return json_model(StatusCode::OK, &json!({ "version": env!("CARGO_PKG_VERSION") }));
        }

        let principal = self.api_principal(&parts.headers)?;

        match (parts.method.clone(), segments.as_slice()) {
            (Method::GET, ["users"]) => {
                require(&principal, AuthCondition::Admin)?;
                json_model(StatusCode::OK, &self.hub.list_users())
            }
            (Method::POST, ["users"]) => {
                require(&principal, AuthCondition::Admin)?;
                let request: BulkCreate = serde_json::from_slice(body).map_err(|_| invalid_json())?;
                let created = self.hub.create_users(&request.usernames, request.admin).await?;
                json_model(StatusCode::CREATED, &created)
            }
            (Method::GET, ["users", name]) => {
                require(&principal, AuthCondition::AdminOrSelf(name))?;
                json_model(StatusCode::OK, &self.hub.get_user(name)?)
            }
            (Method::POST, ["users", name]) => {
                require(&principal, AuthCondition::Admin)?;
                let request: UserCreate = json_body(body)?;
                let model = self.hub.create_user(name, request.admin).await?;
                json_model(StatusCode::CREATED, &model)
            }
            (Method::PATCH, ["users", name]) => {
                require(&principal, AuthCondition::Admin)?;
                let request: UserPatch = json_body(body)?;
                let model = self
                    .hub
                    .update_user(name, request.admin, request.name.as_deref())
                    .await?;
                json_model(StatusCode::OK, &model)
            }
            (Method::DELETE, ["users", name]) => {
                let caller = require(&principal, AuthCondition::Admin)?;
                if caller.user_name() == Some(*name) {
                    return Err(HubError::InvalidInput("Cannot delete yourself!".to_string()));
                }
                self.hub.delete_user(name).await?;
                Ok(empty_response(StatusCode::NO_CONTENT))
            }
            (Method::POST, ["users", name, "server"]) => {
                require(&principal, AuthCondition::AdminOrSelf(name))?;
                let options: Value = json_body::<Option<Value>>(body)?.unwrap_or_else(|| json!({}));
                if !options.is_object() {
                    return Err(HubError::InvalidInput("Spawn options must be a JSON object".to_string()));
                }
                match self.hub.spawn(name, options).await? {
                    OpStatus::Complete => Ok(empty_response(StatusCode::CREATED)),
                    OpStatus::Pending => Ok(empty_response(StatusCode::ACCEPTED)),
                }
            }
            (Method::DELETE, ["users", name, "server"]) => {
                require(&principal, AuthCondition::AdminOrSelf(name))?;
                match self.hub.stop(name).await? {
                    OpStatus::Complete => Ok(empty_response(StatusCode::NO_CONTENT)),
                    OpStatus::Pending => Ok(empty_response(StatusCode::ACCEPTED)),
                }
            }
            (Method::GET, ["authorizations", "token", token]) => {
                require(&principal, AuthCondition::Authenticated)?;
                match self.hub.user_for_token(token)? {
                    Some(Principal::User { name, .. }) => json_model(StatusCode::OK, &self.hub.get_user(&name)?),
                    Some(Principal::Service { name, admin }) => json_model(
                        StatusCode::OK,
                        &json!({ "name": name, "admin": admin, "kind": "service" }),
                    ),
                    None => Err(HubError::NotFound("Token not found".to_string())),
                }
            }
            (Method::GET, ["authorizations", "cookie", cookie_name, value @ ..]) => {
                require(&principal, AuthCondition::Authenticated)?;
                let value = if value.is_empty() {
                    String::from_utf8_lossy(body).trim().to_string()
                } else {
                    value.join("/")
                };
                match self.hub.user_for_cookie(cookie_name, &value) {
                    Some(model) => json_model(StatusCode::OK, &model),
                    None => Err(HubError::NotFound("Cookie not found".to_string())),
                }
            }
            (Method::GET, ["proxy"]) => {
                require(&principal, AuthCondition::Admin)?;
                json_model(StatusCode::OK, &self.hub.proxy().get_routes().await?)
            }
            (Method::POST, ["shutdown"]) => {
                let caller = require(&principal, AuthCondition::Admin)?;
                let request: ShutdownRequest = json_body(body)?;
                info!(by = %caller.name(), servers = request.servers, proxy = request.proxy, "Shutdown requested");
                if self.shutdown_requests.send(request).is_err() {
                    warn!("Nothing is listening for shutdown requests");
                }
                Ok(empty_response(StatusCode::ACCEPTED))
            }
            _ => Err(not_found()),
        }
    }

    async fn token_login(&self, body: &Bytes) -> HubResult<ApiResponse> {
        let credentials: Credentials = serde_json::from_slice(body).map_err(|_| invalid_json())?;
        let token = self.hub.token_login(&credentials).await?;
        json_model(StatusCode::OK, &TokenResponse { authentication: token })
    }

    fn login_url(&self) -> String {
        self.hub.authenticator().login_url(self.hub.base_url())
    }

    /// Send a logged-in user to their running server, anyone else to login
    fn home(&self, parts: &Parts) -> ApiResponse {
        let target = self
            .cookie_user(&parts.headers)
            .and_then(|user| self.hub.server_url(&user.name))
            .unwrap_or_else(|| self.login_url());
        redirect(&target, &[])
    }

    fn login_page(&self, parts: &Parts) -> ApiResponse {
        if let Some(url) = self
            .cookie_user(&parts.headers)
            .and_then(|user| self.hub.server_url(&user.name))
        {
            return redirect(&url, &[]);
        }
        let login_url = self.login_url();
        if login_url != url_path_join(&[self.hub.base_url(), "login"]) {
            return redirect(&login_url, &[]);
        }
        json_response(
            StatusCode::OK,
            json!({ "message": "POST username and password to log in" }).to_string(),
        )
    }

    async fn login(&self, parts: &Parts, body: &Bytes) -> HubResult<ApiResponse> {
        let credentials = credentials_from_body(&parts.headers, body)?;
        let (model, cookies) = self.hub.login(&credentials).await?;

        let body = serde_json::to_string(&model).map_err(anyhow::Error::from)?;
        let mut response = json_response(StatusCode::OK, body);
        for grant in &cookies {
            if let Ok(value) = HeaderValue::from_str(&set_cookie(grant)) {
                response.headers_mut().append(SET_COOKIE, value);
            }
        }
        Ok(response)
    }

    fn logout(&self, parts: &Parts) -> HubResult<ApiResponse> {
        let cleared = match self.cookie_user(&parts.headers) {
            Some(user) => self.hub.logout(&user.name)?,
            None => Vec::new(),
        };
        Ok(redirect(&self.login_url(), &cleared))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessPolicy, PasswordAuthenticator};
    use crate::config::{Config, SpawnerConfig};
    use crate::db::Database;
    use crate::routes::{RouteTable, RoutingTable};
    use crate::token::hash_token;
    use std::collections::HashMap;

    struct TestApi {
        api: HubApi,
        hub: Arc<Hub>,
        shutdown_requests: mpsc::UnboundedReceiver<ShutdownRequest>,
    }

    async fn test_api() -> TestApi {
        let mut config = Config::default();
        config.hub.admin_users = vec!["admin".to_string()];
        config.hub.api_tokens.insert("admin-token".to_string(), "admin".to_string());

        let mut passwords = HashMap::new();
        passwords.insert("admin".to_string(), hash_token("admin-pw"));
        passwords.insert("river".to_string(), hash_token("river-pw"));
        let authenticator = Arc::new(PasswordAuthenticator::new(AccessPolicy::default(), passwords));

        let hub = Hub::new(
            config,
            Database::open_in_memory().unwrap(),
            authenticator,
            crate::spawner::from_config(&SpawnerConfig::default()),
            Arc::new(RoutingTable::new()) as Arc<dyn RouteTable>,
        )
        .unwrap();
        hub.init().await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let api = HubApi::new(Arc::clone(&hub), "127.0.0.1:0".parse().unwrap(), rx, requests_tx);

        TestApi {
            api,
            hub,
            shutdown_requests: requests_rx,
        }
    }

    struct Reply {
        status: StatusCode,
        headers: HeaderMap,
        json: Value,
    }

    impl TestApi {
        async fn call(&self, method: Method, path: &str, headers: &[(&str, &str)], body: &str) -> Reply {
            let mut builder = Request::builder().method(method).uri(path);
            for (key, value) in headers {
                builder = builder.header(*key, *value);
            }
            let (parts, ()) = builder.body(()).unwrap().into_parts();

            let response = self.api.respond(&parts, Bytes::from(body.to_string())).await;
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            Reply { status, headers, json }
        }

        async fn admin(&self, method: Method, path: &str, body: &str) -> Reply {
            self.call(method, path, &[("Authorization", "token admin-token")], body).await
        }

        async fn login_cookie(&self, username: &str, password: &str) -> String {
            let body = json!({ "username": username, "password": password }).to_string();
            let reply = self.call(Method::POST, "/hub/login", &[], &body).await;
            assert_eq!(reply.status, StatusCode::OK);
            let header = reply.headers.get(SET_COOKIE).unwrap().to_str().unwrap();
            header.split(';').next().unwrap().to_string()
        }
    }

    #[test]
    fn test_require() {
        let admin = Some(Principal::User {
            name: "admin".to_string(),
            admin: true,
        });
        let river = Some(Principal::User {
            name: "river".to_string(),
            admin: false,
        });

        assert!(require(&None, AuthCondition::Authenticated).is_err());
        assert!(require(&admin, AuthCondition::Admin).is_ok());
        assert!(require(&river, AuthCondition::Admin).is_err());
        assert!(require(&river, AuthCondition::AdminOrSelf("river")).is_ok());
        assert!(require(&river, AuthCondition::AdminOrSelf("ash")).is_err());
        assert!(require(&admin, AuthCondition::AdminOrSelf("ash")).is_ok());
    }

    #[test]
    fn test_request_token_forms() {
        let mut headers = HeaderMap::new();
        for value in ["token abc", "Token abc", "token: abc", "Bearer abc"] {
            headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
            assert_eq!(request_token(&headers).as_deref(), Some("abc"), "{}", value);
        }
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(request_token(&headers), None);
    }

    #[test]
    fn test_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("a=1; spawnhub-hub-login=\"x|y=\"; b=2"));
        assert_eq!(cookie_value(&headers, HUB_COOKIE_NAME).as_deref(), Some("x|y="));
        assert_eq!(cookie_value(&headers, "b").as_deref(), Some("2"));
        assert_eq!(cookie_value(&headers, "c"), None);
    }

    #[test]
    fn test_form_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded"));
        let body = Bytes::from_static(b"username=River&password=a+b%26c");
        let credentials = credentials_from_body(&headers, &body).unwrap();
        assert_eq!(credentials.username, "River");
        assert_eq!(credentials.password, "a b&c");
    }

    #[tokio::test]
    async fn test_version_options_and_csp() {
        let t = test_api().await;

        let reply = t.call(Method::GET, "/hub/api", &[], "").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.json["version"], env!("CARGO_PKG_VERSION"));
        let csp = reply.headers.get(CONTENT_SECURITY_POLICY).unwrap().to_str().unwrap();
        assert_eq!(csp, "frame-ancestors 'self'; report-uri /hub/security/csp-report");

        let reply = t.call(Method::OPTIONS, "/hub/api/users", &[], "").await;
        assert_eq!(reply.status, StatusCode::NO_CONTENT);
        assert!(reply.headers.contains_key("Access-Control-Allow-Headers"));

        let reply = t.call(Method::GET, "/hub/api/nothing", &[], "").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        assert_eq!(reply.json["status"], 404);
        assert!(reply.headers.contains_key(CONTENT_SECURITY_POLICY));
    }

    #[tokio::test]
    async fn test_users_require_admin() {
        let t = test_api().await;

        let reply = t.call(Method::GET, "/hub/api/users", &[], "").await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);

        let reply = t.call(Method::GET, "/hub/api/users", &[("Authorization", "token wrong")], "").await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);

        let reply = t.admin(Method::GET, "/hub/api/users", "").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.json[0]["name"], "admin");
        assert_eq!(reply.json[0]["admin"], true);
        assert!(reply.json[0]["server"].is_null());
    }

    #[tokio::test]
    async fn test_create_users() {
        let t = test_api().await;

        let reply = t.admin(Method::POST, "/hub/api/users/river", "").await;
        assert_eq!(reply.status, StatusCode::CREATED);
        assert_eq!(reply.json["name"], "river");
        assert_eq!(reply.json["admin"], false);

        let reply = t.admin(Method::POST, "/hub/api/users/river", "").await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.json["message"], "User river already exists");

        let reply = t.admin(Method::POST, "/hub/api/users/ash", r#"{"admin": true}"#).await;
        assert_eq!(reply.json["admin"], true);

        let body = r#"{"usernames": ["river", "ash", "willow"]}"#;
        let reply = t.admin(Method::POST, "/hub/api/users", body).await;
        assert_eq!(reply.status, StatusCode::CREATED);
        assert_eq!(reply.json.as_array().unwrap().len(), 1);
        assert_eq!(reply.json[0]["name"], "willow");

        let reply = t.admin(Method::POST, "/hub/api/users", body).await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.json["message"], "All 3 users already exist");

        let reply = t
            .admin(Method::POST, "/hub/api/users", r#"{"usernames": ["ok", "a/b"]}"#)
            .await;
        assert_eq!(reply.json["message"], "Invalid usernames: a/b");
    }

    #[tokio::test]
    async fn test_bad_json_body() {
        let t = test_api().await;
        let reply = t.admin(Method::POST, "/hub/api/users/river", "{not json").await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.json["message"], "Invalid JSON in body of request");

        let reply = t.admin(Method::PATCH, "/hub/api/users/admin", r#"{"colour": "blue"}"#).await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_patch_and_delete_users() {
        let t = test_api().await;
        t.admin(Method::POST, "/hub/api/users/river", "").await;

        let reply = t.admin(Method::PATCH, "/hub/api/users/river", r#"{"admin": true}"#).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.json["admin"], true);

        let reply = t.admin(Method::DELETE, "/hub/api/users/admin", "").await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.json["message"], "Cannot delete yourself!");

        let reply = t.admin(Method::DELETE, "/hub/api/users/river", "").await;
        assert_eq!(reply.status, StatusCode::NO_CONTENT);
        assert!(!t.hub.user_exists("river"));

        let reply = t.admin(Method::DELETE, "/hub/api/users/river", "").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_user_can_only_see_itself() {
        let t = test_api().await;
        t.hub.create_user("river", false).await.unwrap();
        let token = t.hub.issue_token("river", "api").unwrap();
        let auth = format!("token {}", token);
        let headers = [("Authorization", auth.as_str())];

        let reply = t.call(Method::GET, "/hub/api/users/river", &headers, "").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.json["name"], "river");

        let reply = t.call(Method::GET, "/hub/api/users/admin", &headers, "").await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        let reply = t.call(Method::GET, "/hub/api/users", &headers, "").await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        let reply = t.call(Method::DELETE, "/hub/api/users/river/server", &headers, "").await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_referer_check() {
        let t = test_api().await;
        let cookie = t.login_cookie("admin", "admin-pw").await;

        let reply = t
            .call(Method::GET, "/hub/api/users", &[("Cookie", cookie.as_str()), ("Host", "hub.test")], "")
            .await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);

        let attack = [
            ("Cookie", cookie.as_str()),
            ("Host", "hub.test"),
            ("Referer", "http://attack.com/csrf/vulnerability"),
        ];
        let reply = t.call(Method::GET, "/hub/api/users", &attack, "").await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);

        let own = [
            ("Cookie", cookie.as_str()),
            ("Host", "hub.test"),
            ("Referer", "http://hub.test/hub/foo/bar"),
        ];
        let reply = t.call(Method::GET, "/hub/api/users", &own, "").await;
        assert_eq!(reply.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_authorizations() {
        let t = test_api().await;

        let reply = t
            .call(
                Method::POST,
                "/hub/api/authorizations/token",
                &[],
                r#"{"username": "river", "password": "wrong"}"#,
            )
            .await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);

        let reply = t
            .call(
                Method::POST,
                "/hub/api/authorizations/token",
                &[],
                r#"{"username": "river", "password": "river-pw"}"#,
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK);
        let token = reply.json["Authentication"].as_str().unwrap().to_string();

        let reply = t
            .admin(Method::GET, &format!("/hub/api/authorizations/token/{}", token), "")
            .await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.json["name"], "river");

        let reply = t.admin(Method::GET, "/hub/api/authorizations/token/nope", "").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cookie_authorizations() {
        let t = test_api().await;
        let cookie = t.login_cookie("river", "river-pw").await;
        let value = cookie.split_once('=').unwrap().1.to_string();
        let encoded = urlencoding::encode(&value);

        let path = format!("/hub/api/authorizations/cookie/{}/{}", HUB_COOKIE_NAME, encoded);
        let reply = t.admin(Method::GET, &path, "").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.json["name"], "river");

        let path = format!("/hub/api/authorizations/cookie/{}", HUB_COOKIE_NAME);
        let reply = t.admin(Method::GET, &path, &value).await;
        assert_eq!(reply.json["name"], "river");

        let path = format!("/hub/api/authorizations/cookie/{}/nothintoseehere", HUB_COOKIE_NAME);
        let reply = t.admin(Method::GET, &path, "").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_login_logout_and_home() {
        let t = test_api().await;

        let reply = t.call(Method::GET, "/", &[], "").await;
        assert_eq!(reply.status, StatusCode::FOUND);
        assert_eq!(reply.headers[LOCATION], "/hub/login");

        let reply = t
            .call(
                Method::POST,
                "/hub/login",
                &[("Content-Type", "application/x-www-form-urlencoded")],
                "username=river&password=bad",
            )
            .await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);

        let cookie = t.login_cookie("river", "river-pw").await;
        assert!(cookie.starts_with("spawnhub-hub-login="));

        let reply = t.call(Method::GET, "/hub/logout", &[("Cookie", cookie.as_str())], "").await;
        assert_eq!(reply.status, StatusCode::FOUND);
        assert_eq!(reply.headers[LOCATION], "/hub/login");
        let cleared = reply.headers.get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cleared.contains("Max-Age=0"));

        let value = cookie.split_once('=').unwrap().1;
        assert!(t.hub.user_for_cookie(HUB_COOKIE_NAME, value).is_none());
    }

    #[tokio::test]
    async fn test_proxy_and_shutdown() {
        let mut t = test_api().await;
        t.hub.check_routes().await.unwrap();

        let reply = t.admin(Method::GET, "/hub/api/proxy", "").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.json["/"]["hub"], true);

        let reply = t.admin(Method::POST, "/hub/api/shutdown", r#"{"servers": false}"#).await;
        assert_eq!(reply.status, StatusCode::ACCEPTED);
        let request = t.shutdown_requests.recv().await.unwrap();
        assert_eq!(
            request,
            ShutdownRequest {
                servers: false,
                proxy: true
            }
        );
    }

    #[tokio::test]
    async fn test_csp_report() {
        let t = test_api().await;
        let reply = t
            .call(Method::POST, "/hub/security/csp-report", &[], r#"{"csp-report": {}}"#)
            .await;
        assert_eq!(reply.status, StatusCode::NO_CONTENT);

        let reply = t.call(Method::GET, "/elsewhere", &[], "").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }
}
