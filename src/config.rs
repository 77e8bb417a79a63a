use crate::backoff::Backoff;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the hub
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Hub API server and lifecycle settings
    #[serde(default)]
    pub hub: HubConfig,

    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Authentication backend
    #[serde(default)]
    pub authenticator: AuthenticatorConfig,

    /// Per-user server backend
    #[serde(default)]
    pub spawner: SpawnerConfig,

    /// Base parameters for every wait the hub performs
    #[serde(default)]
    pub backoff: Backoff,

    /// External services registered with the hub
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubConfig {
    /// Bind address of the hub API server (default: 127.0.0.1)
    #[serde(default = "default_hub_ip")]
    pub ip: String,

    /// Port of the hub API server (default: 8081)
    #[serde(default = "default_hub_port")]
    pub port: u16,

    /// URL prefix of the hub (default: /hub/)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path of the SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Hex secret used to sign hub cookies.
    /// If not set, a random secret is generated at startup and
    /// every existing login is invalidated by a restart.
    pub cookie_secret: Option<String>,

    /// Lifetime of hub and server cookies in days (default: 14)
    #[serde(default = "default_cookie_max_age_days")]
    pub cookie_max_age_days: u64,

    /// Maximum cached cookie lookups (default: 1024)
    #[serde(default = "default_cookie_cache_max_entries")]
    pub cookie_cache_max_entries: usize,

    /// Cached cookie lookup lifetime in seconds (default: 300)
    #[serde(default = "default_cookie_cache_ttl")]
    pub cookie_cache_ttl_secs: u64,

    /// Users created as admins at startup
    #[serde(default)]
    pub admin_users: Vec<String>,

    /// Pre-issued API tokens, token -> username
    #[serde(default)]
    pub api_tokens: HashMap<String, String>,

    /// Seconds a spawn request waits before answering 202 (default: 10)
    #[serde(default = "default_slow_spawn_timeout")]
    pub slow_spawn_timeout_secs: u64,

    /// Seconds a stop request waits before answering 202 (default: 10)
    #[serde(default = "default_slow_stop_timeout")]
    pub slow_stop_timeout_secs: u64,

    /// Seconds the spawner's start call may take (default: 60)
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Seconds a started server has to accept connections (default: 30)
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Seconds a stopped server has to exit (default: 10)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Seconds between route reconciliations (default: 60)
    #[serde(default = "default_check_routes_interval")]
    pub check_routes_interval_secs: u64,

    /// Seconds between liveness polls of running servers (default: 30)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds between managed service checks (default: 5)
    #[serde(default = "default_service_check_interval")]
    pub service_check_interval_secs: u64,

    /// Remove proxy routes that no running server or service accounts for
    #[serde(default)]
    pub prune_orphan_routes: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ip: default_hub_ip(),
            port: default_hub_port(),
            base_url: default_base_url(),
            db_path: default_db_path(),
            pid_file: None,
            cookie_secret: None,
            cookie_max_age_days: default_cookie_max_age_days(),
            cookie_cache_max_entries: default_cookie_cache_max_entries(),
            cookie_cache_ttl_secs: default_cookie_cache_ttl(),
            admin_users: Vec::new(),
            api_tokens: HashMap::new(),
            slow_spawn_timeout_secs: default_slow_spawn_timeout(),
            slow_stop_timeout_secs: default_slow_stop_timeout(),
            start_timeout_secs: default_start_timeout(),
            http_timeout_secs: default_http_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            check_routes_interval_secs: default_check_routes_interval(),
            poll_interval_secs: default_poll_interval(),
            service_check_interval_secs: default_service_check_interval(),
            prune_orphan_routes: false,
        }
    }
}

impl HubConfig {
    pub fn cookie_max_age(&self) -> Duration {
        Duration::from_secs(self.cookie_max_age_days * 86400)
    }

    pub fn cookie_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cookie_cache_ttl_secs)
    }

    pub fn slow_spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.slow_spawn_timeout_secs)
    }

    pub fn slow_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.slow_stop_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// URL of the hub API as seen from spawned servers and services
    pub fn api_url(&self) -> String {
        format!(
            "http://{}:{}{}api",
            crate::utils::connectable_ip(&self.ip),
            self.port,
            self.base_url
        )
    }
}

/// How routes reach the reverse proxy
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Run the built-in proxy inside the hub process (default)
    #[default]
    Builtin,
    /// Talk to an externally managed proxy over its REST API
    External,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// "builtin" (default) or "external"
    #[serde(default)]
    pub mode: ProxyMode,

    /// Public bind address (default: 0.0.0.0)
    #[serde(default = "default_public_ip")]
    pub public_ip: String,

    /// Public port (default: 8000)
    #[serde(default = "default_public_port")]
    pub public_port: u16,

    /// Routing API bind address (default: 127.0.0.1)
    #[serde(default = "default_hub_ip")]
    pub api_ip: String,

    /// Routing API port (default: 8001)
    #[serde(default = "default_proxy_api_port")]
    pub api_port: u16,

    /// Routing API URL of an external proxy (default: http://{api_ip}:{api_port})
    pub api_url: Option<String>,

    /// Token for the routing API.
    /// If not set, a random token is generated at startup and logged
    pub auth_token: Option<String>,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max seconds for a routed backend to respond (default: 300)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mode: ProxyMode::default(),
            public_ip: default_public_ip(),
            public_port: default_public_port(),
            api_ip: default_hub_ip(),
            api_port: default_proxy_api_port(),
            api_url: None,
            auth_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn api_url(&self) -> String {
        self.api_url.clone().unwrap_or_else(|| {
            format!(
                "http://{}:{}",
                crate::utils::connectable_ip(&self.api_ip),
                self.api_port
            )
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Authentication backend kind
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticatorKind {
    /// Passwords hashed in the config file (default)
    #[default]
    Password,
    /// Delegate credential checks to a remote HTTP endpoint
    Remote,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthenticatorConfig {
    /// "password" (default) or "remote"
    #[serde(default)]
    pub kind: AuthenticatorKind,

    /// Usernames allowed to log in; empty admits everyone
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// OS groups whose members may log in; takes precedence over `whitelist`
    #[serde(default)]
    pub group_whitelist: Vec<String>,

    /// Anchored regex new usernames must match (empty: any name without '/')
    #[serde(default)]
    pub username_pattern: String,

    /// Require a matching OS account for every hub user
    #[serde(default)]
    pub local_accounts: bool,

    /// Create missing OS accounts with useradd (requires local_accounts)
    #[serde(default)]
    pub create_system_users: bool,

    /// username -> password hash (`algorithm:rounds:salt:digest`)
    #[serde(default)]
    pub users: HashMap<String, String>,

    /// Credential check endpoint of the remote backend
    pub url: Option<String>,

    /// External login page; replaces the hub's own login URL
    pub login_url: Option<String>,

    /// External logout page; replaces the hub's own logout URL
    pub logout_url: Option<String>,
}

/// Spawner backend kind
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SpawnerKind {
    /// Local process spawned directly (default)
    #[default]
    Local,
    /// Docker container managed via Docker API
    Docker,
}

/// Image pull policy for the Docker spawner
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before starting
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

/// Configuration for per-user servers
///
/// # Security Warning
///
/// `command`, `args` and `pre_spawn_command` are executed with the
/// permissions of the hub process. Protect the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct SpawnerConfig {
    /// "local" (default) or "docker"
    #[serde(default)]
    pub kind: SpawnerKind,

    /// Program started for each user (local only)
    #[serde(default = "default_spawn_command")]
    pub command: String,

    /// Arguments placed before the hub-provided flags
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, `{username}` is substituted (local only)
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Address servers bind to (default: 127.0.0.1)
    #[serde(default = "default_hub_ip")]
    pub ip: String,

    /// Shell command run before each spawn, with HUB_USER set
    pub pre_spawn_command: Option<String>,

    /// Grace period in seconds between SIGTERM and SIGKILL (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Docker image to run (required for the Docker spawner)
    pub image: Option<String>,

    /// Docker host URL (default: unix:///var/run/docker.sock)
    pub docker_host: Option<String>,

    /// Docker network to connect to (default: bridge)
    pub network: Option<String>,

    /// Image pull policy: "always", "never", or "if-not-present" (default)
    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Memory limit (e.g., "512m", "1g")
    pub memory: Option<String>,

    /// CPU limit (e.g., "0.5", "2")
    pub cpus: Option<String>,

    /// host path -> container path, `{username}` is substituted in both
    #[serde(default)]
    pub volumes: HashMap<String, String>,

    /// Port the server listens on inside the container (default: 8888)
    #[serde(default = "default_container_port")]
    pub container_port: u16,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            kind: SpawnerKind::default(),
            command: default_spawn_command(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            ip: default_hub_ip(),
            pre_spawn_command: None,
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            image: None,
            docker_host: None,
            network: None,
            pull_policy: PullPolicy::default(),
            memory: None,
            cpus: None,
            volumes: HashMap::new(),
            container_port: default_container_port(),
        }
    }
}

impl SpawnerConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.kind {
            SpawnerKind::Local => {
                if self.command.trim().is_empty() {
                    return Err("Spawner: local spawner requires 'command' field".to_string());
                }
            }
            SpawnerKind::Docker => {
                if self.image.is_none() {
                    return Err("Spawner: Docker spawner requires 'image' field".to_string());
                }
            }
        }
        if let Some(ref hook) = self.pre_spawn_command {
            if shell_words::split(hook).map(|w| w.is_empty()).unwrap_or(true) {
                return Err(format!("Spawner: invalid 'pre_spawn_command': {}", hook));
            }
        }
        Ok(())
    }
}

/// An external service registered with the hub
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Unique service name, routed at /services/{name}
    pub name: String,

    /// Command for a hub-managed service; unmanaged if absent
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Where the service listens; adds a proxy route when set
    pub url: Option<String>,

    /// Grant admin rights to the service token
    #[serde(default)]
    pub admin: bool,

    /// API token of the service (generated for managed services if absent)
    pub api_token: Option<String>,
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(format!("Service '{}': invalid name", self.name));
        }
        if self.command.is_none() && self.url.is_none() && self.api_token.is_none() {
            return Err(format!(
                "Service '{}': needs at least one of 'command', 'url' or 'api_token'",
                self.name
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_hub_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_hub_port() -> u16 {
    8081
}

fn default_base_url() -> String {
    "/hub/".to_string()
}

fn default_db_path() -> String {
    "spawnhub.sqlite".to_string()
}

fn default_cookie_max_age_days() -> u64 {
    14
}

fn default_cookie_cache_max_entries() -> usize {
    1024
}

fn default_cookie_cache_ttl() -> u64 {
    300 // 5 minutes
}

fn default_slow_spawn_timeout() -> u64 {
    10
}

fn default_slow_stop_timeout() -> u64 {
    10
}

fn default_start_timeout() -> u64 {
    60
}

fn default_http_timeout() -> u64 {
    30
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_check_routes_interval() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    30
}

fn default_service_check_interval() -> u64 {
    5
}

fn default_public_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_public_port() -> u16 {
    8000
}

fn default_proxy_api_port() -> u16 {
    8001
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_request_timeout() -> u64 {
    300 // long-polling user servers are common
}

fn default_spawn_command() -> String {
    "spawnhub-singleuser".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    5 // 5 seconds between SIGTERM and SIGKILL
}

fn default_container_port() -> u16 {
    8888
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !self.hub.base_url.starts_with('/') || !self.hub.base_url.ends_with('/') {
            errors.push(format!(
                "Hub: 'base_url' must start and end with '/': {}",
                self.hub.base_url
            ));
        }

        if let Some(ref secret) = self.hub.cookie_secret {
            if hex::decode(secret).map(|b| b.len() < 16).unwrap_or(true) {
                errors.push("Hub: 'cookie_secret' must be at least 16 hex-encoded bytes".to_string());
            }
        }

        if !self.authenticator.username_pattern.is_empty() {
            if let Err(e) = regex::Regex::new(&self.authenticator.username_pattern) {
                errors.push(format!("Authenticator: invalid 'username_pattern': {}", e));
            }
        }

        if self.authenticator.kind == AuthenticatorKind::Remote && self.authenticator.url.is_none() {
            errors.push("Authenticator: remote authenticator requires 'url' field".to_string());
        }

        if self.authenticator.create_system_users && !self.authenticator.local_accounts {
            errors.push("Authenticator: 'create_system_users' requires 'local_accounts'".to_string());
        }

        if let Err(e) = self.spawner.validate() {
            errors.push(e);
        }

        if self.backoff.scale_factor < 1.0 {
            errors.push("Backoff: 'scale_factor' must be at least 1.0".to_string());
        }
        if !(0.0..1.0).contains(&self.backoff.timeout_tolerance) {
            errors.push("Backoff: 'timeout_tolerance' must be in [0, 1)".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if let Err(e) = service.validate() {
                errors.push(e);
            }
            if !seen.insert(service.name.as_str()) {
                errors.push(format!("Service '{}': duplicate name", service.name));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[hub]
port = 9081
base_url = "/jhub/"
admin_users = ["admin"]
prune_orphan_routes = true

[hub.api_tokens]
"0123456789abcdef" = "admin"

[proxy]
mode = "external"
api_url = "http://127.0.0.1:9001"
auth_token = "proxy-secret"

[authenticator]
whitelist = ["river", "lake"]
username_pattern = "^[a-z][a-z0-9]*$"

[authenticator.users]
river = "sha512:16384:abcd:ef01"

[spawner]
command = "/usr/local/bin/spawnhub-singleuser"
args = ["--debug"]
pre_spawn_command = "mkdir -p /srv/data"

[backoff]
start_wait = 0.1
timeout = 20

[[services]]
name = "cull-idle"
command = "cull-idle"
args = ["--timeout=3600"]
admin = true

[[services]]
name = "announcement"
url = "http://127.0.0.1:8888"
api_token = "announce-token"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.hub.port, 9081);
        assert_eq!(config.hub.base_url, "/jhub/");
        assert!(config.hub.prune_orphan_routes);
        assert_eq!(config.hub.api_tokens.get("0123456789abcdef").unwrap(), "admin");
        assert_eq!(config.proxy.mode, ProxyMode::External);
        assert_eq!(config.proxy.api_url(), "http://127.0.0.1:9001");
        assert_eq!(config.authenticator.whitelist.len(), 2);
        assert_eq!(config.spawner.kind, SpawnerKind::Local);
        assert_eq!(config.backoff.timeout, Duration::from_secs(20));
        assert_eq!(config.services.len(), 2);
        assert!(config.services[0].admin);
        assert_eq!(config.services[1].url.as_deref(), Some("http://127.0.0.1:8888"));
    }

    #[test]
    fn test_default_hub_config() {
        let config = HubConfig::default();
        assert_eq!(config.ip, "127.0.0.1");
        assert_eq!(config.port, 8081);
        assert_eq!(config.base_url, "/hub/");
        assert_eq!(config.slow_spawn_timeout(), Duration::from_secs(10));
        assert_eq!(config.stop_timeout(), Duration::from_secs(10));
        assert_eq!(config.cookie_max_age(), Duration::from_secs(14 * 86400));
        assert!(!config.prune_orphan_routes);
        assert_eq!(config.api_url(), "http://127.0.0.1:8081/hub/api");
    }

    #[test]
    fn test_default_proxy_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.mode, ProxyMode::Builtin);
        assert_eq!(config.public_port, 8000);
        assert_eq!(config.api_url(), "http://127.0.0.1:8001");
        assert_eq!(config.pool_max_idle_per_host, 10);
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.spawner.command, "spawnhub-singleuser");
        assert_eq!(config.authenticator.kind, AuthenticatorKind::Password);
    }

    #[test]
    fn test_validate_collects_errors() {
        let toml = r#"
[hub]
base_url = "hub"
cookie_secret = "abc"

[authenticator]
kind = "remote"
username_pattern = "(["
create_system_users = true

[spawner]
kind = "docker"

[[services]]
name = "bad/name"

[[services]]
name = "dup"
url = "http://127.0.0.1:1"

[[services]]
name = "dup"
url = "http://127.0.0.1:2"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("base_url"));
        assert!(err.contains("cookie_secret"));
        assert!(err.contains("username_pattern"));
        assert!(err.contains("requires 'url'"));
        assert!(err.contains("create_system_users"));
        assert!(err.contains("requires 'image'"));
        assert!(err.contains("invalid name"));
        assert!(err.contains("duplicate name"));
    }

    #[test]
    fn test_parse_docker_spawner() {
        let spawner: SpawnerConfig = toml::from_str(r#"
kind = "docker"
image = "spawnhub/singleuser:latest"
pull_policy = "always"
memory = "1g"

[volumes]
"/srv/homes/{username}" = "/home/{username}"
"#)
        .unwrap();

        spawner.validate().unwrap();
        assert_eq!(spawner.kind, SpawnerKind::Docker);
        assert_eq!(spawner.pull_policy, PullPolicy::Always);
        assert_eq!(spawner.container_port, 8888);
        assert_eq!(spawner.volumes.len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spawnhub.toml");
        std::fs::write(&path, "[hub]\nport = 7000\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.hub.port, 7000);

        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
