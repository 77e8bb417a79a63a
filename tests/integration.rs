//! End-to-end tests for the hub: API, built-in proxy and real single-user servers

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use spawnhub::api::{HubApi, ShutdownRequest};
use spawnhub::auth::{AccessPolicy, PasswordAuthenticator};
use spawnhub::config::Config;
use spawnhub::db::Database;
use spawnhub::hub::Hub;
use spawnhub::proxy::ProxyServer;
use spawnhub::routes::{RouteTable, RoutingTable};
use spawnhub::token::hash_token;
use spawnhub::utils::{can_connect, random_port};
use tokio::sync::{mpsc, watch};

const ADMIN_TOKEN: &str = "integration-admin-token";

struct TestStack {
    hub: Arc<Hub>,
    routes: Arc<RoutingTable>,
    proxy_url: String,
    client: reqwest::Client,
    shutdown_tx: watch::Sender<bool>,
    _shutdown_requests: mpsc::UnboundedReceiver<ShutdownRequest>,
    _dir: tempfile::TempDir,
}

async fn wait_for_port(port: u16) {
    for _ in 0..100 {
        if can_connect("127.0.0.1", port).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("port {} never opened", port);
}

/// Start a hub and the built-in proxy on random ports
async fn start_stack(configure: impl FnOnce(&mut Config)) -> TestStack {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.hub.port = random_port().unwrap();
    config.hub.db_path = dir.path().join("hub.sqlite").to_string_lossy().into_owned();
    config.hub.admin_users = vec!["admin".to_string()];
    config.hub.api_tokens.insert(ADMIN_TOKEN.to_string(), "admin".to_string());
    config.hub.http_timeout_secs = 10;
    config.spawner.command = env!("CARGO_BIN_EXE_spawnhub-singleuser").to_string();
    config.spawner.shutdown_grace_period_secs = 2;
    configure(&mut config);

    let mut passwords = HashMap::new();
    passwords.insert("river".to_string(), hash_token("river-pw"));
    let authenticator = Arc::new(PasswordAuthenticator::new(AccessPolicy::default(), passwords));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let routes = Arc::new(RoutingTable::new());

    let db = Database::open(&config.hub.db_path).unwrap();
    let hub = Hub::new(
        config.clone(),
        db,
        authenticator,
        spawnhub::spawner::from_config(&config.spawner),
        Arc::clone(&routes) as Arc<dyn RouteTable>,
    )
    .unwrap();
    hub.init().await.unwrap();
    hub.check_routes().await.unwrap();

    let proxy_port = random_port().unwrap();
    let proxy_addr: SocketAddr = format!("127.0.0.1:{}", proxy_port).parse().unwrap();
    let proxy = ProxyServer::new(proxy_addr, Arc::clone(&routes), Duration::from_secs(30), shutdown_rx.clone());
    tokio::spawn(async move {
        let _ = proxy.run().await;
    });

    let api_addr: SocketAddr = format!("127.0.0.1:{}", config.hub.port).parse().unwrap();
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let api = Arc::new(HubApi::new(Arc::clone(&hub), api_addr, shutdown_rx, requests_tx));
    tokio::spawn(async move {
        let _ = api.run().await;
    });

    wait_for_port(proxy_port).await;
    wait_for_port(config.hub.port).await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap();

    TestStack {
        hub,
        routes,
        proxy_url: format!("http://127.0.0.1:{}", proxy_port),
        client,
        shutdown_tx,
        _shutdown_requests: requests_rx,
        _dir: dir,
    }
}

impl TestStack {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.proxy_url, path)
    }

    async fn api(&self, method: reqwest::Method, path: &str) -> reqwest::Response {
        self.client
            .request(method, self.url(&format!("/hub/api{}", path)))
            .header("Authorization", format!("token {}", ADMIN_TOKEN))
            .send()
            .await
            .unwrap()
    }

    async fn user(&self, name: &str) -> Value {
        self.api(reqwest::Method::GET, &format!("/users/{}", name))
            .await
            .json()
            .await
            .unwrap()
    }

    /// Log in through the proxy and return the `Cookie` header to send
    async fn login(&self, username: &str, password: &str) -> String {
        let response = self
            .client
            .post(self.url("/hub/login"))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        response
            .headers()
            .get_all("set-cookie")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Wait until the user's `server` field matches `running`
    async fn wait_for_server(&self, name: &str, running: bool) -> Value {
        for _ in 0..200 {
            let model = self.user(name).await;
            if model["server"].is_null() != running && model["pending"].is_null() {
                return model;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("server for {} never reached running={}", name, running);
    }

    async fn shutdown(self) {
        self.hub.stop_all_servers().await;
        let _ = self.shutdown_tx.send(true);
    }
}

#[tokio::test]
async fn test_spawn_visit_and_stop_user_server() {
    let stack = start_stack(|_| {}).await;

    let cookie = stack.login("river", "river-pw").await;
    assert!(cookie.contains("spawnhub-hub-login="));

    let model = stack.user("river").await;
    assert_eq!(model["name"], "river");
    assert!(model["server"].is_null());

    let response = stack.api(reqwest::Method::POST, "/users/river/server").await;
    assert!(
        response.status() == StatusCode::CREATED || response.status() == StatusCode::ACCEPTED,
        "unexpected status {}",
        response.status()
    );
    let model = stack.wait_for_server("river", true).await;
    assert_eq!(model["server"], "/user/river");
    assert_eq!(
        stack.routes.snapshot()["/user/river"].data["user"],
        "river"
    );

    // Logging in again hands out the server cookie as well
    let cookie = stack.login("river", "river-pw").await;
    assert!(cookie.contains("spawnhub-user-river="));

    let response = stack
        .client
        .get(stack.url("/user/river/"))
        .header("Cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "/user/river");

    let response = stack.client.get(stack.url("/user/river/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response.headers()["location"].to_str().unwrap();
    assert!(location.starts_with("/hub/login"), "{}", location);

    let response = stack.client.get(stack.url("/hub/")).header("Cookie", &cookie).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()["location"], "/user/river/");

    let response = stack.api(reqwest::Method::DELETE, "/users/river/server").await;
    assert!(
        response.status() == StatusCode::NO_CONTENT || response.status() == StatusCode::ACCEPTED,
        "unexpected status {}",
        response.status()
    );
    stack.wait_for_server("river", false).await;
    assert!(!stack.routes.snapshot().contains_key("/user/river"));

    let response = stack.api(reqwest::Method::DELETE, "/users/river/server").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    stack.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_server_is_cleaned_up() {
    let stack = start_stack(|config| {
        config.hub.http_timeout_secs = 1;
        config.spawner.command = "sh".to_string();
        config.spawner.args = vec!["-c".to_string(), "sleep 30".to_string()];
    })
    .await;

    let response = stack
        .client
        .post(stack.url("/hub/api/users/admin/server"))
        .header("Authorization", format!("token {}", ADMIN_TOKEN))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], 500);

    let model = stack.user("admin").await;
    assert!(model["server"].is_null());
    assert!(model["pending"].is_null());
    assert!(!stack.routes.snapshot().contains_key("/user/admin"));

    stack.shutdown().await;
}

#[tokio::test]
async fn test_cookie_api_requires_same_origin_referer() {
    let stack = start_stack(|_| {}).await;
    let cookie = stack.login("river", "river-pw").await;
    let host = stack.proxy_url.trim_start_matches("http://").to_string();

    let response = stack
        .client
        .get(stack.url("/hub/api/users/river"))
        .header("Cookie", &cookie)
        .header("Referer", "http://attack.com/csrf/vulnerability")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = stack
        .client
        .get(stack.url("/hub/api/users/river"))
        .header("Cookie", &cookie)
        .header("Referer", format!("http://{}/hub/home", host))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let model: Value = response.json().await.unwrap();
    assert_eq!(model["name"], "river");

    stack.shutdown().await;
}

#[tokio::test]
async fn test_check_routes_restores_missing_routes() {
    let stack = start_stack(|_| {}).await;

    stack.routes.remove("/");
    let response = stack.client.get(stack.url("/hub/api")).send().await.unwrap();
    assert_ne!(response.status(), StatusCode::OK);

    stack.hub.check_routes().await.unwrap();
    let response = stack.client.get(stack.url("/hub/api")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    stack.shutdown().await;
}
