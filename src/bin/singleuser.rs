//! Reference single-user server
//!
//! The hub starts one of these per user. It answers `{base_url}` with its own
//! base URL for requests carrying a valid cookie of its user, and redirects
//! everyone else to the hub's login page. Cookies are verified by the hub's
//! cookie authorization endpoint and cached locally.

use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, CONTENT_TYPE, COOKIE, LOCATION};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use spawnhub::cache::CookieCache;
use spawnhub::error::json_error_response;
use spawnhub::utils::url_path_join;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

const COOKIE_CACHE_ENTRIES: usize = 256;
const COOKIE_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Parser, Debug, Clone)]
#[command(name = "spawnhub-singleuser", about = "Single-user server spawned by spawnhub")]
struct Args {
    #[arg(long, help = "User this server belongs to")]
    user: String,

    #[arg(long, default_value_t = 8888)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    #[arg(long = "base-url", help = "URL prefix the proxy routes to this server")]
    base_url: String,

    #[arg(long = "hub-prefix", default_value = "/hub/")]
    hub_prefix: String,

    #[arg(long = "hub-api-url", help = "Hub API used to verify cookies")]
    hub_api_url: String,

    #[arg(long = "cookie-name", help = "Cookie the hub sets for this server")]
    cookie_name: String,

    #[arg(long = "api-token", env = "HUB_API_TOKEN", hide_env_values = true)]
    api_token: String,
}

/// Why a request could not be authenticated
enum VerifyError {
    /// The hub refused our token
    Forbidden,
    /// The hub could not be reached or failed
    Upstream,
}

struct SingleUser {
    args: Args,
    argv: Vec<String>,
    client: reqwest::Client,
    /// cookie value -> user name, `None` for cookies the hub rejected
    cookie_cache: CookieCache<Option<String>>,
}

impl SingleUser {
    async fn verify_cookie(&self, value: &str) -> Result<Option<String>, VerifyError> {
        if let Some(cached) = self.cookie_cache.get(value) {
            return Ok(cached);
        }

        let url = url_path_join(&[
            &self.args.hub_api_url,
            "authorizations/cookie",
            &urlencoding::encode(&self.args.cookie_name),
            &urlencoding::encode(value),
        ]);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("token {}", self.args.api_token))
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to reach the hub to verify a cookie");
                VerifyError::Upstream
            })?;

        let status = response.status();
        let user = if status == reqwest::StatusCode::NOT_FOUND {
            None
        } else if status == reqwest::StatusCode::FORBIDDEN {
            error!("Not permitted to verify cookies, the API token may have expired");
            return Err(VerifyError::Forbidden);
        } else if !status.is_success() {
            warn!(status = status.as_u16(), "Hub failed to verify cookie");
            return Err(VerifyError::Upstream);
        } else {
            let model: serde_json::Value = response.json().await.map_err(|e| {
                warn!(error = %e, "Bad cookie verification response");
                VerifyError::Upstream
            })?;
            model["name"].as_str().map(str::to_string)
        };

        let owner = user.clone().unwrap_or_default();
        self.cookie_cache.insert(value, owner, user.clone());
        Ok(user)
    }

    fn login_redirect(&self, path: &str) -> Response<Full<Bytes>> {
        let login = url_path_join(&[&self.args.hub_prefix, "login"]);
        let location = format!("{}?next={}", login, urlencoding::encode(path));
        Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, location)
            .body(Full::new(Bytes::new()))
            .expect("valid response")
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let base = self.args.base_url.trim_end_matches('/');
        debug!(path = %path, "Single-user request");

        let Some(rest) = path.strip_prefix(base) else {
            return Ok(json_error_response(StatusCode::NOT_FOUND, "Not found"));
        };

        let response = match rest.trim_end_matches('/') {
            "" => self.home(req.headers(), &path).await,
            "/args" => {
                let body = serde_json::to_string(&self.argv).unwrap_or_else(|_| "[]".to_string());
                Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Full::new(Bytes::from(body)))
                    .expect("valid response")
            }
            "/logout" => Response::builder()
                .status(StatusCode::FOUND)
                .header(LOCATION, url_path_join(&[&self.args.hub_prefix, "logout"]))
                .body(Full::new(Bytes::new()))
                .expect("valid response"),
            _ => json_error_response(StatusCode::NOT_FOUND, "Not found"),
        };
        Ok(response)
    }

    async fn home(&self, headers: &HeaderMap, path: &str) -> Response<Full<Bytes>> {
        let cookie = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.args.cookie_name)
            .map(|(_, value)| value.trim_matches('"').to_string());

        let Some(cookie) = cookie else {
            debug!("No login cookie");
            return self.login_redirect(path);
        };

        match self.verify_cookie(&cookie).await {
            Ok(Some(user)) if user == self.args.user => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain")
                .body(Full::new(Bytes::from(self.args.base_url.clone())))
                .expect("valid response"),
            Ok(_) => self.login_redirect(path),
            Err(VerifyError::Forbidden) => json_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Permission failure checking authorization, I may need to be restarted",
            ),
            Err(VerifyError::Upstream) => {
                json_error_response(StatusCode::BAD_GATEWAY, "Failed to check authorization (upstream problem)")
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spawnhub_singleuser=debug".parse().expect("valid log directive")),
        )
        .init();

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.ip, args.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    let server = Arc::new(SingleUser {
        argv: std::env::args().collect(),
        client: reqwest::Client::builder().timeout(Duration::from_secs(20)).build()?,
        cookie_cache: CookieCache::new(COOKIE_CACHE_ENTRIES, COOKIE_CACHE_TTL),
        args,
    });

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, user = %server.args.user, base_url = %server.args.base_url, "Single-user server listening");

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let server = Arc::clone(&server);
                        async move { server.handle_request(req).await }
                    });
                    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(addr = %peer, error = %e, "Connection error");
                    }
                });
            }
            _ = terminate => {
                info!("Received SIGTERM, exiting");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, exiting");
                break;
            }
        }
    }

    Ok(())
}
