//! Docker container backend for user servers

use crate::config::{PullPolicy, SpawnerConfig};
use crate::spawner::{SpawnContext, Spawner};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

/// What to run for one user
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub container_port: u16,
    /// Published on 127.0.0.1
    pub host_port: u16,
    pub network: Option<String>,
    /// `host:container` bind mounts
    pub binds: Vec<String>,
    pub memory: Option<String>,
    pub cpus: Option<String>,
    pub pull_policy: PullPolicy,
}

/// Manages Docker containers for user servers
pub struct DockerManager {
    client: Docker,
}

impl DockerManager {
    /// Create a new DockerManager connecting to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        // Verify connection
        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    /// First responsive socket among the usual install locations
    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let candidates = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in candidates.iter().filter(|p| std::path::Path::new(p).exists()) {
            match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                Ok(client) if client.ping().await.is_ok() => {
                    debug!(path, "Found Docker socket");
                    return Ok(client);
                }
                Ok(_) => debug!(path, "Docker socket exists but daemon not responding"),
                Err(e) => debug!(path, error = %e, "Docker socket connection failed"),
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. Set DOCKER_HOST or [spawner] docker_host.",
                e
            )
        })
    }

    /// Pull a Docker image if needed based on pull policy
    pub async fn pull_image_if_needed(
        &self,
        image: &str,
        policy: &PullPolicy,
    ) -> anyhow::Result<()> {
        let should_pull = match policy {
            PullPolicy::Always => true,
            PullPolicy::Never => {
                // Check if image exists, fail if not
                if self.client.inspect_image(image).await.is_err() {
                    anyhow::bail!("Image '{}' not found locally and pull_policy is 'never'", image);
                }
                false
            }
            PullPolicy::IfNotPresent => {
                // Check if image exists locally
                match self.client.inspect_image(image).await {
                    Ok(_) => {
                        debug!(image, "Image exists locally, skipping pull");
                        false
                    }
                    Err(_) => true,
                }
            }
        };

        if should_pull {
            info!(image, "Pulling Docker image");
            let options = CreateImageOptions {
                from_image: image,
                ..Default::default()
            };

            let mut stream = self.client.create_image(Some(options), None, None);
            let mut last_error = None;

            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = info.status {
                            debug!(image, status, "Pull progress");
                        }
                        if let Some(error) = info.error {
                            last_error = Some(error);
                        }
                    }
                    Err(e) => {
                        let err_str = e.to_string();
                        if err_str.contains("unauthorized") || err_str.contains("authentication") {
                            anyhow::bail!("Authentication required to pull '{}': {}", image, e);
                        }
                        anyhow::bail!("Failed to pull image '{}': {}", image, e);
                    }
                }
            }

            if let Some(error) = last_error {
                anyhow::bail!("Failed to pull image '{}': {}", image, error);
            }

            info!(image, "Image pulled successfully");
        }

        Ok(())
    }

    /// Create and start the container described by `spec`
    pub async fn start_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        self.pull_image_if_needed(&spec.image, &spec.pull_policy).await?;

        // A container left over from a previous hub run would hold the name
        let _ = self.remove_container(&spec.name).await;

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let port_key = format!("{}/tcp", spec.container_port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let mut host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: spec.network.clone(),
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            ..Default::default()
        };

        if let Some(ref memory) = spec.memory {
            host_config.memory = Some(parse_memory_limit(memory)?);
        }
        if let Some(ref cpus) = spec.cpus {
            let cpu_count: f64 = cpus.parse().map_err(|_| {
                anyhow::anyhow!("Invalid CPU limit: {}", cpus)
            })?;
            // NanoCPUs is CPUs * 1e9
            host_config.nano_cpus = Some((cpu_count * 1_000_000_000.0) as i64);
        }

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("port is already allocated") || err_str.contains("address already in use") {
                    anyhow::anyhow!(
                        "Port {} is already in use. Another container or process is using this port.",
                        spec.host_port
                    )
                } else {
                    anyhow::anyhow!(
                        "Failed to create container '{}' from image '{}': {}",
                        spec.name, spec.image, e
                    )
                }
            })?;

        let container_id = response.id;
        info!(
            container_id,
            container_name = %spec.name,
            image = %spec.image,
            "Created Docker container"
        );

        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("OCI runtime") || err_str.contains("executable file not found") {
                    anyhow::anyhow!(
                        "Container failed to start: the image '{}' may have an invalid entrypoint or command. \
                         Error: {}",
                        spec.image, e
                    )
                } else {
                    anyhow::anyhow!(
                        "Failed to start container '{}' (id: {}): {}",
                        spec.name, container_id, e
                    )
                }
            })?;

        info!(container_id, "Started Docker container");

        Ok(container_id)
    }

    /// Stop a container gracefully
    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                // Container already stopped
                debug!(container_id, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                // Container doesn't exist
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container: {}", e)),
        }
    }

    /// Force kill a container
    pub async fn kill_container(&self, container_id: &str) -> anyhow::Result<()> {
        match self.client.kill_container::<String>(container_id, None).await {
            Ok(_) => {
                info!(container_id, "Killed Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                // Container not running
                debug!(container_id, "Container not running");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to kill container: {}", e)),
        }
    }

    /// Remove a container
    pub async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => {
                debug!(container_id, "Removed Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => {
                warn!(container_id, error = %e, "Failed to remove container");
                Ok(()) // Don't fail on removal errors
            }
        }
    }

    /// Check if a container is running
    pub async fn is_running(&self, container_id: &str) -> bool {
        match self.client.inspect_container(container_id, None).await {
            Ok(info) => info
                .state
                .and_then(|s| s.running)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Forward a container's output to tracing until the returned sender fires
    pub fn stream_logs(&self, container_id: String, user: String) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = self.client.clone();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut log_stream = client.logs(&container_id, Some(options));

            loop {
                let output = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    next = log_stream.next() => next,
                };

                let (stream, message) = match output {
                    Some(Ok(LogOutput::StdOut { message })) => ("stdout", message),
                    Some(Ok(LogOutput::StdErr { message })) => ("stderr", message),
                    Some(Ok(LogOutput::Console { message })) => ("console", message),
                    Some(Ok(LogOutput::StdIn { .. })) => continue,
                    Some(Err(e)) => {
                        warn!(user, container_id, error = %e, "Error reading container logs");
                        break;
                    }
                    None => break,
                };

                let text = String::from_utf8_lossy(&message);
                let line = text.trim_end();
                if line.is_empty() {
                    continue;
                }
                if stream == "stderr" {
                    warn!(target: "container", user, stream, "{}", line);
                } else {
                    info!(target: "container", user, stream, "{}", line);
                }
            }
            debug!(user, container_id, "Log streaming stopped");
        });

        shutdown_tx
    }
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with("g") || limit.ends_with("gb") {
        let num = limit.trim_end_matches("gb").trim_end_matches("g");
        (num, 1024 * 1024 * 1024i64)
    } else if limit.ends_with("m") || limit.ends_with("mb") {
        let num = limit.trim_end_matches("mb").trim_end_matches("m");
        (num, 1024 * 1024i64)
    } else if limit.ends_with("k") || limit.ends_with("kb") {
        let num = limit.trim_end_matches("kb").trim_end_matches("k");
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str.parse().map_err(|_| {
        anyhow::anyhow!("Invalid memory limit: {}", limit)
    })?;

    Ok((num * multiplier as f64) as i64)
}

/// Wrapper to share DockerManager across tasks
pub type SharedDockerManager = Arc<DockerManager>;

/// Docker connection shared by every user's spawner, opened on first use
pub type SharedDockerCell = Arc<OnceCell<SharedDockerManager>>;

/// `{username}` substituted on both sides of each volume mapping
pub fn volume_binds(volumes: &HashMap<String, String>, user: &str) -> Vec<String> {
    let mut binds: Vec<String> = volumes
        .iter()
        .map(|(host, container)| {
            format!(
                "{}:{}",
                host.replace("{username}", user),
                container.replace("{username}", user)
            )
        })
        .collect();
    binds.sort();
    binds
}

pub fn container_name(user: &str) -> String {
    let safe: String = user
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    format!("spawnhub-{}", safe)
}

/// Runs each user's server in its own container
pub struct DockerSpawner {
    user: String,
    config: SpawnerConfig,
    docker: SharedDockerCell,
    container_id: Mutex<Option<String>>,
    log_shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl DockerSpawner {
    pub fn new(user: &str, config: SpawnerConfig, docker: SharedDockerCell) -> Self {
        Self {
            user: user.to_string(),
            config,
            docker,
            container_id: Mutex::new(None),
            log_shutdown: Mutex::new(None),
        }
    }

    async fn get_docker(&self) -> anyhow::Result<SharedDockerManager> {
        let docker_host = self.config.docker_host.as_deref();
        self.docker
            .get_or_try_init(|| async {
                let manager = DockerManager::new(docker_host).await?;
                Ok(Arc::new(manager))
            })
            .await
            .cloned()
    }

    fn container_id(&self) -> Option<String> {
        self.container_id.lock().clone()
    }

    pub fn container_spec(&self, ctx: &SpawnContext, host_port: u16) -> anyhow::Result<ContainerSpec> {
        let image = self
            .config
            .image
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Docker spawner requires 'image' field"))?;

        let mut cmd = self.config.args.clone();
        cmd.extend(ctx.server_args("0.0.0.0", self.config.container_port));

        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(ctx.server_env());

        Ok(ContainerSpec {
            name: container_name(&self.user),
            image,
            cmd,
            env,
            container_port: self.config.container_port,
            host_port,
            network: self.config.network.clone(),
            binds: volume_binds(&self.config.volumes, &self.user),
            memory: self.config.memory.clone(),
            cpus: self.config.cpus.clone(),
            pull_policy: self.config.pull_policy.clone(),
        })
    }
}

#[async_trait]
impl Spawner for DockerSpawner {
    async fn start(&self, ctx: &SpawnContext) -> anyhow::Result<(String, u16)> {
        let host_port = if ctx.port == 0 {
            crate::utils::random_port()?
        } else {
            ctx.port
        };
        let spec = self.container_spec(ctx, host_port)?;

        info!(user = %self.user, image = %spec.image, host_port, "Starting Docker server");

        let docker = self
            .get_docker()
            .await
            .map_err(|e| anyhow::anyhow!("Cannot start Docker server for {}: {}", self.user, e))?;
        let container_id = docker.start_container(&spec).await?;

        let log_shutdown = docker.stream_logs(container_id.clone(), self.user.clone());
        *self.log_shutdown.lock() = Some(log_shutdown);
        *self.container_id.lock() = Some(container_id);

        Ok(("127.0.0.1".to_string(), host_port))
    }

    async fn poll(&self) -> Option<i32> {
        let Some(container_id) = self.container_id() else {
            return Some(0);
        };
        let docker = match self.get_docker().await {
            Ok(docker) => docker,
            Err(e) => {
                warn!(user = %self.user, error = %e, "Cannot poll container");
                return Some(-1);
            }
        };
        if docker.is_running(&container_id).await {
            None
        } else {
            Some(0)
        }
    }

    async fn stop(&self, now: bool) -> anyhow::Result<()> {
        let Some(container_id) = self.container_id() else {
            return Ok(());
        };
        if let Some(shutdown) = self.log_shutdown.lock().take() {
            let _ = shutdown.send(true);
        }

        let docker = self.get_docker().await?;
        info!(user = %self.user, container_id, "Stopping Docker container");

        let grace_period = if now {
            Duration::ZERO
        } else {
            self.config.shutdown_grace_period()
        };

        // docker stop sends SIGTERM and waits
        if let Err(e) = docker.stop_container(&container_id, grace_period).await {
            warn!(user = %self.user, container_id, error = %e, "Error stopping container, forcing kill");
            let _ = docker.kill_container(&container_id).await;
        }

        docker.remove_container(&container_id).await
    }

    fn get_state(&self) -> Value {
        match self.container_id() {
            Some(id) => json!({ "container_id": id }),
            None => json!({}),
        }
    }

    fn load_state(&self, state: &Value) {
        if let Some(id) = state.get("container_id").and_then(|v| v.as_str()) {
            *self.container_id.lock() = Some(id.to_string());
        }
    }

    fn clear_state(&self) {
        *self.container_id.lock() = None;
        if let Some(shutdown) = self.log_shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
    }
}
