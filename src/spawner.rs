//! Spawner capability and the local-process backend
//!
//! A [`Spawner`] owns exactly one user's server. The hub asks a
//! [`SpawnerFactory`] for a spawner per user and keeps it across stops, so
//! `poll` keeps answering after the server has exited.

use crate::config::{SpawnerConfig, SpawnerKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Interval between exit checks while a process is shutting down
const EXIT_POLL_INTERVAL_MS: u64 = 50;

/// Everything a spawner needs to launch one user's server
#[derive(Debug, Clone)]
pub struct SpawnContext {
    pub user: String,
    /// URL prefix the server is routed at, e.g. `/user/river`
    pub base_url: String,
    /// URL prefix of the hub, e.g. `/hub/`
    pub hub_prefix: String,
    pub hub_api_url: String,
    /// Token the server uses to call the hub API
    pub api_token: String,
    /// Cookie the server sets for its user
    pub cookie_name: String,
    pub ip: String,
    /// 0 lets the spawner choose
    pub port: u16,
    pub user_options: Value,
}

impl SpawnContext {
    /// Command-line flags understood by the single-user server
    pub fn server_args(&self, ip: &str, port: u16) -> Vec<String> {
        vec![
            format!("--user={}", self.user),
            format!("--port={}", port),
            format!("--ip={}", ip),
            format!("--base-url={}", self.base_url),
            format!("--hub-prefix={}", self.hub_prefix),
            format!("--hub-api-url={}", self.hub_api_url),
            format!("--cookie-name={}", self.cookie_name),
        ]
    }

    /// Environment passed to the single-user server
    pub fn server_env(&self) -> Vec<(String, String)> {
        vec![
            ("HUB_API_TOKEN".to_string(), self.api_token.clone()),
            ("HUB_USER".to_string(), self.user.clone()),
            ("HUB_USER_OPTIONS".to_string(), self.user_options.to_string()),
        ]
    }
}

/// Process backend for one user's server
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Launch the server and return the `(ip, port)` it will listen on
    async fn start(&self, ctx: &SpawnContext) -> anyhow::Result<(String, u16)>;

    /// `None` while running, `Some(exit_status)` once it is gone
    async fn poll(&self) -> Option<i32>;

    /// Ask the server to exit; `now` skips the graceful phase
    async fn stop(&self, now: bool) -> anyhow::Result<()>;

    /// State persisted so a restarted hub can re-attach
    fn get_state(&self) -> Value;

    fn load_state(&self, state: &Value);

    fn clear_state(&self);
}

/// Creates one spawner per user
pub trait SpawnerFactory: Send + Sync {
    fn create(&self, user: &str) -> Arc<dyn Spawner>;
}

impl<F> SpawnerFactory for F
where
    F: Fn(&str) -> Arc<dyn Spawner> + Send + Sync,
{
    fn create(&self, user: &str) -> Arc<dyn Spawner> {
        self(user)
    }
}

/// Factory for the spawner selected by `[spawner] kind`
pub fn from_config(config: &SpawnerConfig) -> Arc<dyn SpawnerFactory> {
    let config = config.clone();
    match config.kind {
        SpawnerKind::Local => Arc::new(move |user: &str| -> Arc<dyn Spawner> {
            Arc::new(LocalProcessSpawner::new(user, config.clone()))
        }),
        SpawnerKind::Docker => {
            let docker = crate::docker::SharedDockerCell::default();
            Arc::new(move |user: &str| -> Arc<dyn Spawner> {
                Arc::new(crate::docker::DockerSpawner::new(
                    user,
                    config.clone(),
                    docker.clone(),
                ))
            })
        }
    }
}

/// Run `pre_spawn_command` for `user`; a non-zero exit aborts the spawn
pub async fn run_pre_spawn_hook(command: &str, user: &str) -> anyhow::Result<()> {
    let words = shell_words::split(command)
        .map_err(|e| anyhow::anyhow!("Invalid pre_spawn_command '{}': {}", command, e))?;
    let (program, args) = words
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("Empty pre_spawn_command"))?;

    debug!(user, command, "Running pre-spawn hook");
    let output = Command::new(program)
        .args(args)
        .env("HUB_USER", user)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run pre_spawn_command '{}': {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "pre_spawn_command exited with {}: {}",
            output.status,
            stderr.trim()
        );
    }
    Ok(())
}

/// Forward a child's output lines to tracing
fn forward_output<R>(user: &str, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let user = user.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stream == "stderr" {
                warn!(target: "singleuser", user, stream, "{}", line);
            } else {
                info!(target: "singleuser", user, stream, "{}", line);
            }
        }
    });
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> bool {
    // SAFETY: kill(2) has no memory-safety preconditions
    unsafe { libc::kill(pid as i32, signal) == 0 }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    send_signal(pid, 0)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

/// Runs the single-user server as a child process of the hub
pub struct LocalProcessSpawner {
    user: String,
    config: SpawnerConfig,
    child: Mutex<Option<Child>>,
    /// Survives a hub restart through `get_state` / `load_state`
    pid: Mutex<Option<u32>>,
}

impl LocalProcessSpawner {
    pub fn new(user: &str, config: SpawnerConfig) -> Self {
        Self {
            user: user.to_string(),
            config,
            child: Mutex::new(None),
            pid: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    fn exit_status(&self) -> Option<i32> {
        let mut child = self.child.lock();
        if let Some(c) = child.as_mut() {
            return match c.try_wait() {
                Ok(None) => None,
                Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
                Err(e) => {
                    warn!(user = %self.user, error = %e, "Failed to poll server process");
                    Some(-1)
                }
            };
        }
        drop(child);

        match self.pid() {
            Some(pid) if pid_alive(pid) => None,
            _ => Some(0),
        }
    }

    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.exit_status().is_some() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS)).await;
        }
    }

    fn kill(&self) {
        if let Some(c) = self.child.lock().as_mut() {
            let _ = c.start_kill();
            return;
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid() {
                send_signal(pid, libc::SIGKILL);
            }
        }
    }
}

#[async_trait]
impl Spawner for LocalProcessSpawner {
    async fn start(&self, ctx: &SpawnContext) -> anyhow::Result<(String, u16)> {
        let port = if ctx.port == 0 {
            crate::utils::random_port()?
        } else {
            ctx.port
        };

        info!(user = %self.user, command = %self.config.command, port, "Starting single-user server");

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        cmd.args(ctx.server_args(&ctx.ip, port));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir.replace("{username}", &self.user));
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        for (key, value) in ctx.server_env() {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("Failed to spawn '{}' for {}: {}", self.config.command, self.user, e)
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(&self.user, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(&self.user, "stderr", stderr);
        }

        let pid = child.id();
        info!(user = %self.user, pid = ?pid, "Single-user server spawned");

        *self.pid.lock() = pid;
        *self.child.lock() = Some(child);

        Ok((ctx.ip.clone(), port))
    }

    async fn poll(&self) -> Option<i32> {
        self.exit_status()
    }

    async fn stop(&self, now: bool) -> anyhow::Result<()> {
        if self.exit_status().is_some() {
            debug!(user = %self.user, "Server already exited");
            return Ok(());
        }

        if now {
            info!(user = %self.user, "Killing single-user server");
            self.kill();
            self.wait_for_exit(Duration::from_secs(1)).await;
            return Ok(());
        }

        let grace_period = self.config.shutdown_grace_period();

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid() {
                info!(user = %self.user, pid, "Sending SIGTERM to single-user server");
                send_signal(pid, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        self.kill();

        if self.wait_for_exit(grace_period).await {
            info!(user = %self.user, "Single-user server exited gracefully");
        } else {
            warn!(
                user = %self.user,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            self.kill();
            self.wait_for_exit(Duration::from_secs(1)).await;
        }
        Ok(())
    }

    fn get_state(&self) -> Value {
        match self.pid() {
            Some(pid) => json!({ "pid": pid }),
            None => json!({}),
        }
    }

    fn load_state(&self, state: &Value) {
        if let Some(pid) = state.get("pid").and_then(|p| p.as_u64()) {
            *self.pid.lock() = Some(pid as u32);
        }
    }

    fn clear_state(&self) {
        *self.pid.lock() = None;
        *self.child.lock() = None;
    }
}
