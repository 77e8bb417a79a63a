use spawnhub::api::{HubApi, ShutdownRequest};
use spawnhub::config::{Config, ProxyMode};
use spawnhub::db::Database;
use spawnhub::hub::Hub;
use spawnhub::pool::PoolConfig;
use spawnhub::proxy::{ProxyApiServer, ProxyServer};
use spawnhub::routes::{ProxyClient, RouteTable, RoutingTable};
use spawnhub::services::ServiceManager;
use spawnhub::token::new_token;
use spawnhub::{auth, spawner, PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spawnhub=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("spawnhub.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.hub.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_token = config.proxy.auth_token.clone().unwrap_or_else(|| {
        let token = new_token();
        info!(token = %token, "Generated proxy API token (configure proxy.auth_token to set a fixed value)");
        token
    });

    let (routes, proxy_handles) = start_proxy(&config, &proxy_token, &shutdown_rx)?;

    if let Some(parent) = Path::new(&config.hub.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = Database::open(&config.hub.db_path)?;
    let authenticator = auth::from_config(&config.authenticator)?;
    let spawners = spawner::from_config(&config.spawner);

    let hub = Hub::new(config.clone(), db, authenticator, spawners, routes)?;
    hub.init().await?;
    if let Err(e) = hub.check_routes().await {
        warn!(error = %e, "Initial route check failed, will retry");
    }

    let services = ServiceManager::new(config.hub.api_url(), config.backoff);
    services.start_all(&hub, &config.services)?;
    let services_monitor = services.spawn_monitor(
        Duration::from_secs(config.hub.service_check_interval_secs),
        shutdown_rx.clone(),
    );

    let api_addr = bind_addr(&config.hub.ip, config.hub.port, "hub")?;
    let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
    let api = Arc::new(HubApi::new(Arc::clone(&hub), api_addr, shutdown_rx.clone(), requests_tx));
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!(error = %e, "Hub API server error");
        }
    });

    tokio::spawn(maintenance_loop(Arc::clone(&hub), shutdown_rx.clone()));

    info!(
        url = %format!("http://{}:{}{}", config.proxy.public_ip, config.proxy.public_port, config.hub.base_url),
        "Hub is now running"
    );

    let request = wait_for_shutdown(&mut requests_rx).await?;

    let _ = shutdown_tx.send(true);

    // A service check already in flight must finish before services are stopped
    if tokio::time::timeout(Duration::from_secs(5), services_monitor).await.is_err() {
        warn!("Service monitor did not finish in time");
    }

    if request.servers {
        hub.stop_all_servers().await;
    } else {
        info!("Leaving user servers running");
    }

    info!("Stopping managed services...");
    services.stop_all().await;

    if !request.proxy && config.proxy.mode == ProxyMode::Builtin {
        warn!("The built-in proxy exits with the hub");
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in proxy_handles {
            let _ = handle.await;
        }
        let _ = api_handle.await;
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn bind_addr(ip: &str, port: u16, what: &str) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", ip, port).parse().map_err(|e| {
        error!(ip, port, error = %e, "Invalid {} bind address", what);
        anyhow::anyhow!("Invalid {} bind address: {}", what, e)
    })
}

/// Start the built-in proxy, or connect to an external one
fn start_proxy(
    config: &Config,
    token: &str,
    shutdown_rx: &watch::Receiver<bool>,
) -> anyhow::Result<(Arc<dyn RouteTable>, Vec<JoinHandle<()>>)> {
    if config.proxy.mode == ProxyMode::External {
        let api_url = config.proxy.api_url();
        info!(api_url = %api_url, "Using external proxy");
        let client = ProxyClient::new(api_url, token)?;
        return Ok((Arc::new(client), Vec::new()));
    }

    let table = Arc::new(RoutingTable::new());

    let pool_config = PoolConfig {
        max_idle_per_host: config.proxy.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.proxy.pool_idle_timeout_secs),
    };
    let public_addr = bind_addr(&config.proxy.public_ip, config.proxy.public_port, "proxy")?;
    let proxy = ProxyServer::with_pool_config(
        public_addr,
        Arc::clone(&table),
        config.proxy.request_timeout(),
        shutdown_rx.clone(),
        pool_config,
    );

    let api_addr = bind_addr(&config.proxy.api_ip, config.proxy.api_port, "proxy API")?;
    let proxy_api = ProxyApiServer::new(api_addr, Arc::clone(&table), token, shutdown_rx.clone());

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });
    let proxy_api_handle = tokio::spawn(async move {
        if let Err(e) = proxy_api.run().await {
            error!(error = %e, "Proxy API server error");
        }
    });

    Ok((table as Arc<dyn RouteTable>, vec![proxy_handle, proxy_api_handle]))
}

/// Periodic route reconciliation, liveness polling and activity updates
async fn maintenance_loop(hub: Arc<Hub>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut routes_tick = tokio::time::interval(Duration::from_secs(hub.config().hub.check_routes_interval_secs));
    let mut poll_tick = tokio::time::interval(Duration::from_secs(hub.config().hub.poll_interval_secs));
    routes_tick.tick().await;
    poll_tick.tick().await;

    loop {
        tokio::select! {
            _ = routes_tick.tick() => {
                if let Err(e) = hub.check_routes().await {
                    warn!(error = %e, "Route check failed");
                }
                if let Err(e) = hub.update_last_activity().await {
                    warn!(error = %e, "Failed to update last activity");
                }
            }
            _ = poll_tick.tick() => {
                hub.poll_servers().await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Wait for a signal or an API shutdown request
async fn wait_for_shutdown(
    requests: &mut mpsc::UnboundedReceiver<ShutdownRequest>,
) -> anyhow::Result<ShutdownRequest> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            Some(request) = requests.recv() => {
                info!(servers = request.servers, proxy = request.proxy, "Shutting down on API request...");
                return Ok(request);
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down...");
            }
            Some(request) = requests.recv() => {
                return Ok(request);
            }
        }
    }

    Ok(ShutdownRequest::default())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another hub is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting hub");
    info!(
        ip = %config.hub.ip,
        port = config.hub.port,
        base_url = %config.hub.base_url,
        db = %config.hub.db_path,
        "Hub configuration"
    );
    info!(
        mode = ?config.proxy.mode,
        public_ip = %config.proxy.public_ip,
        public_port = config.proxy.public_port,
        api_url = %config.proxy.api_url(),
        "Proxy configuration"
    );
    info!(
        authenticator = ?config.authenticator.kind,
        spawner = ?config.spawner.kind,
        admin_users = ?config.hub.admin_users,
        services = config.services.len(),
        "Backends"
    );
    info!(
        slow_spawn_timeout_secs = config.hub.slow_spawn_timeout_secs,
        http_timeout_secs = config.hub.http_timeout_secs,
        stop_timeout_secs = config.hub.stop_timeout_secs,
        "Lifecycle timeouts"
    );
}
