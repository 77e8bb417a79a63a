//! External services registered with the hub
//!
//! Every configured service gets an API identity and, if it has a `url`, a
//! proxy route at `/services/{name}`. Services with a `command` are managed:
//! the hub launches them, checks on them periodically and restarts any that
//! exit.

use crate::backoff::{exponential_backoff, Backoff};
use crate::config::ServiceConfig;
use crate::hub::{service_prefix, Hub};
use crate::token::new_token;
use crate::utils::url_path_join;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How long a managed service gets to exit after SIGTERM
const SERVICE_STOP_GRACE: Duration = Duration::from_secs(5);

struct ManagedService {
    config: ServiceConfig,
    token: String,
    child: Mutex<Option<Child>>,
}

impl ManagedService {
    fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(|c| c.id())
    }

    /// `None` while running
    fn exit_status(&self) -> Option<i32> {
        let mut child = self.child.lock();
        let Some(c) = child.as_mut() else {
            return Some(0);
        };
        match c.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Err(e) => {
                warn!(service = %self.config.name, error = %e, "Failed to poll service process");
                Some(-1)
            }
        }
    }
}

/// Launches and supervises managed services
pub struct ServiceManager {
    services: DashMap<String, ManagedService>,
    hub_api_url: String,
    backoff: Backoff,
    /// Set once `stop_all` begins; nothing is relaunched afterwards
    stopping: AtomicBool,
}

impl ServiceManager {
    pub fn new(hub_api_url: impl Into<String>, backoff: Backoff) -> Arc<Self> {
        Arc::new(Self {
            services: DashMap::new(),
            hub_api_url: hub_api_url.into(),
            backoff,
            stopping: AtomicBool::new(false),
        })
    }

    /// Register every service with the hub and launch the managed ones
    pub fn start_all(&self, hub: &Hub, services: &[ServiceConfig]) -> anyhow::Result<()> {
        for config in services {
            let token = match (&config.api_token, &config.command) {
                (Some(token), _) => Some(token.clone()),
                (None, Some(_)) => Some(new_token()),
                (None, None) => None,
            };
            hub.register_service(&config.name, config.url.clone(), config.admin, token.as_deref());

            let (Some(_), Some(token)) = (&config.command, token) else {
                debug!(service = %config.name, "Registered external service");
                continue;
            };

            self.services.insert(
                config.name.clone(),
                ManagedService {
                    config: config.clone(),
                    token,
                    child: Mutex::new(None),
                },
            );
            self.launch(&config.name)?;
        }
        Ok(())
    }

    fn launch(&self, name: &str) -> anyhow::Result<u32> {
        if self.stopping.load(Ordering::SeqCst) {
            anyhow::bail!("Not starting service '{}' during shutdown", name);
        }
        let service = self
            .services
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown service: {}", name))?;
        let config = &service.config;
        let command = config
            .command
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Service '{}' has no command", name))?;

        let mut cmd = Command::new(command);
        cmd.args(&config.args);
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = config.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        cmd.env("HUB_API_TOKEN", &service.token);
        cmd.env("HUB_SERVICE_NAME", name);
        cmd.env("HUB_API_URL", &self.hub_api_url);
        cmd.env("HUB_SERVICE_URL", config.url.as_deref().unwrap_or(""));
        cmd.env("HUB_SERVICE_PREFIX", url_path_join(&[&service_prefix(name), "/"]));

        let child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to start service '{}': {}", name, e))?;
        let pid = child.id().unwrap_or(0);
        *service.child.lock() = Some(child);

        info!(service = name, pid, command = %command, "Started managed service");
        Ok(pid)
    }

    pub fn pid(&self, name: &str) -> Option<u32> {
        self.services.get(name).and_then(|s| s.pid())
    }

    /// Restart every managed service that has exited
    pub async fn check_services(&self) {
        let names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();

        for name in names {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            let status = self.services.get(&name).and_then(|s| s.exit_status());
            let Some(status) = status else {
                continue;
            };
            warn!(service = %name, exit_status = status, "Managed service exited, restarting");

            let this = self;
            let service: &str = &name;
            let message = format!("Service {} could not be restarted", name);
            let restarted = exponential_backoff(&self.backoff, &message, move || async move {
                if this.stopping.load(Ordering::SeqCst) {
                    return Some(0);
                }
                match this.launch(service) {
                    Ok(pid) => Some(pid),
                    Err(e) => {
                        warn!(service, error = %e, "Restart attempt failed");
                        None
                    }
                }
            })
            .await;

            if let Err(e) = restarted {
                error!(service = %name, error = %e, "Giving up on managed service");
            }
        }
    }

    /// Check services every `interval` until shutdown
    pub fn spawn_monitor(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.check_services().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    /// Terminate managed services, escalating to SIGKILL after a grace period
    pub async fn stop_all(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();

        for name in names {
            let child = self.services.get(&name).and_then(|s| {
                let child = s.child.lock().take();
                child
            });
            let Some(mut child) = child else {
                continue;
            };

            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    info!(service = %name, pid, "Sending SIGTERM to managed service");
                    // SAFETY: kill(2) has no memory-safety preconditions
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                }
            }

            match tokio::time::timeout(SERVICE_STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!(service = %name, ?status, "Managed service exited"),
                Ok(Err(e)) => warn!(service = %name, error = %e, "Error waiting for service to exit"),
                Err(_) => {
                    warn!(service = %name, "Service ignored SIGTERM, killing it");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessPolicy, PasswordAuthenticator};
    use crate::config::{Config, SpawnerConfig};
    use crate::db::Database;
    use crate::routes::{RouteTable, RoutingTable};
    use std::collections::HashMap;

    fn test_hub() -> Arc<Hub> {
        let authenticator = Arc::new(PasswordAuthenticator::new(AccessPolicy::default(), HashMap::new()));
        Hub::new(
            Config::default(),
            Database::open_in_memory().unwrap(),
            authenticator,
            crate::spawner::from_config(&SpawnerConfig::default()),
            Arc::new(RoutingTable::new()) as Arc<dyn RouteTable>,
        )
        .unwrap()
    }

    fn service(name: &str, script: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            command: Some("sh".to_string()),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            env: HashMap::new(),
            url: None,
            admin: true,
            api_token: None,
        }
    }

    #[tokio::test]
    async fn test_external_service_registration() {
        let hub = test_hub();
        let manager = ServiceManager::new("http://127.0.0.1:8081/hub/api", Backoff::default());

        let external = ServiceConfig {
            command: None,
            api_token: Some("external-token".to_string()),
            admin: false,
            ..service("announce", "")
        };
        manager.start_all(&hub, &[external]).unwrap();

        assert_eq!(manager.pid("announce"), None);
        let principal = hub.user_for_token("external-token").unwrap().unwrap();
        assert_eq!(principal.name(), "announce");
        assert!(!principal.is_admin());
    }

    #[tokio::test]
    async fn test_managed_service_environment() {
        let hub = test_hub();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env");
        let manager = ServiceManager::new("http://127.0.0.1:8081/hub/api", Backoff::default());

        let script = format!(
            "echo \"$HUB_SERVICE_NAME $HUB_SERVICE_PREFIX $HUB_API_URL\" > {}; echo \"$HUB_API_TOKEN\" >> {}; sleep 30",
            out.display(),
            out.display()
        );
        manager.start_all(&hub, &[service("cull", &script)]).unwrap();

        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(&out).unwrap_or_default();
            if contents.lines().count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut lines = contents.lines();
        assert_eq!(
            lines.next(),
            Some("cull /services/cull/ http://127.0.0.1:8081/hub/api")
        );
        let token = lines.next().unwrap();
        let principal = hub.user_for_token(token).unwrap().unwrap();
        assert_eq!(principal.name(), "cull");
        assert!(principal.is_admin());

        manager.stop_all().await;
        assert_eq!(manager.pid("cull"), None);
    }

    #[tokio::test]
    async fn test_stopped_services_are_not_restarted() {
        let hub = test_hub();
        let manager = ServiceManager::new("http://127.0.0.1:8081/hub/api", Backoff::default());
        manager.start_all(&hub, &[service("cull", "sleep 30")]).unwrap();
        assert!(manager.pid("cull").is_some());

        manager.stop_all().await;
        manager.check_services().await;
        assert_eq!(manager.pid("cull"), None);
        assert!(manager.launch("cull").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dead_service_is_restarted() {
        let hub = test_hub();
        let manager = ServiceManager::new("http://127.0.0.1:8081/hub/api", Backoff::default());
        manager.start_all(&hub, &[service("cull", "sleep 30")]).unwrap();

        let first = manager.pid("cull").unwrap();
        manager.check_services().await;
        assert_eq!(manager.pid("cull"), Some(first));

        unsafe {
            libc::kill(first as i32, libc::SIGKILL);
        }
        for _ in 0..50 {
            if manager.services.get("cull").unwrap().exit_status().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        manager.check_services().await;
        let second = manager.pid("cull").unwrap();
        assert_ne!(first, second);

        manager.stop_all().await;
    }
}
