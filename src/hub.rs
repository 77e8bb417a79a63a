//! User and server lifecycle orchestration
//!
//! The [`Hub`] owns every user's state and drives their servers through
//! `stopped -> spawning -> running -> stopping -> stopped`. A user's
//! `pending` field is the per-user transition lock: at most one spawn or
//! stop is in flight, duplicates of the same operation join it, and the
//! opposite operation is refused. Each in-flight operation publishes its
//! outcome on a watch channel so that any number of requests can wait on it
//! with their own deadline.

use crate::auth::{Authenticator, Credentials};
use crate::backoff::exponential_backoff;
use crate::cache::CookieCache;
use crate::config::Config;
use crate::db::Database;
use crate::error::{HubError, HubResult};
use crate::routes::{normalize_prefix, RouteTable};
use crate::spawner::{run_pre_spawn_hook, SpawnContext, Spawner, SpawnerFactory};
use crate::token::{compare_token, hash_token, new_secret, new_token, token_prefix, CookieSigner};
use crate::user::{new_cookie_id, Pending, Server, ServerState, User, UserModel};
use crate::utils::{can_connect, connectable_ip, url_path_join};
use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Name of the cookie that authenticates a browser to the hub itself
pub const HUB_COOKIE_NAME: &str = "spawnhub-hub-login";

const TOKEN_NOTE_API: &str = "api";
const TOKEN_NOTE_SERVER: &str = "server";

type OpOutcome = Option<HubResult<()>>;

/// Whether a spawn or stop finished within the caller's wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Complete,
    Pending,
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User { name: String, admin: bool },
    Service { name: String, admin: bool },
}

impl Principal {
    pub fn name(&self) -> &str {
        match self {
            Principal::User { name, .. } | Principal::Service { name, .. } => name.as_str(),
        }
    }

    pub fn is_admin(&self) -> bool {
        match self {
            Principal::User { admin, .. } | Principal::Service { admin, .. } => *admin,
        }
    }

    /// Name of the user, if this is a user rather than a service
    pub fn user_name(&self) -> Option<&str> {
        match self {
            Principal::User { name, .. } => Some(name.as_str()),
            Principal::Service { .. } => None,
        }
    }
}

/// A cookie for the API layer to set. An empty value clears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieGrant {
    pub name: String,
    pub value: String,
    pub path: String,
}

#[derive(Debug, Clone)]
struct ServiceEntry {
    url: Option<String>,
    admin: bool,
    hashed_token: Option<String>,
}

struct SlotState {
    user: User,
    op: Option<watch::Receiver<OpOutcome>>,
    /// Set while the user is being deleted or renamed; no new operation may start
    removing: bool,
}

struct UserSlot {
    state: Mutex<SlotState>,
    spawner: Arc<dyn Spawner>,
}

impl UserSlot {
    fn new(user: User, spawner: Arc<dyn Spawner>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState {
                user,
                op: None,
                removing: false,
            }),
            spawner,
        })
    }

    fn snapshot(&self) -> User {
        self.state.lock().user.clone()
    }

    fn with_user<R>(&self, f: impl FnOnce(&mut User) -> R) -> R {
        f(&mut self.state.lock().user)
    }

    fn op(&self) -> Option<watch::Receiver<OpOutcome>> {
        self.state.lock().op.clone()
    }

    /// A server exists or a transition is in flight
    fn busy(&self) -> bool {
        let state = self.state.lock();
        state.user.pending.is_some() || state.user.server.is_some()
    }

    /// Mark an idle slot as being removed so no operation can be admitted.
    /// Returns `Ok(false)` if the slot is busy.
    fn claim_for_removal(&self) -> HubResult<bool> {
        let mut state = self.state.lock();
        if state.removing {
            return Err(HubError::NotFound(format!("No such user: {}", state.user.name)));
        }
        if state.user.pending.is_some() || state.user.server.is_some() {
            return Ok(false);
        }
        state.removing = true;
        Ok(true)
    }

    fn release_claim(&self) {
        self.state.lock().removing = false;
    }
}

enum Admission {
    Started(watch::Sender<OpOutcome>, watch::Receiver<OpOutcome>),
    InFlight(watch::Receiver<OpOutcome>),
}

async fn await_outcome(mut rx: watch::Receiver<OpOutcome>, wait: Duration) -> HubResult<OpStatus> {
    match tokio::time::timeout(wait, rx.wait_for(|outcome| outcome.is_some())).await {
        Err(_) => Ok(OpStatus::Pending),
        Ok(Err(_)) => Err(HubError::Internal(anyhow::anyhow!(
            "operation ended without reporting an outcome"
        ))),
        Ok(Ok(outcome)) => match (*outcome).clone() {
            Some(result) => result.map(|()| OpStatus::Complete),
            None => Ok(OpStatus::Pending),
        },
    }
}

fn route_data(key: &str, value: impl Into<Value>) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert(key.to_string(), value.into());
    data
}

/// Routing prefix of a service
pub fn service_prefix(name: &str) -> String {
    format!("/services/{}", urlencoding::encode(name))
}

/// The control plane: users, their servers, services, tokens and cookies
pub struct Hub {
    config: Config,
    db: Database,
    authenticator: Arc<dyn Authenticator>,
    spawners: Arc<dyn SpawnerFactory>,
    proxy: Arc<dyn RouteTable>,
    users: DashMap<String, Arc<UserSlot>>,
    services: DashMap<String, ServiceEntry>,
    cookie_signer: CookieSigner,
    cookie_cache: CookieCache<String>,
}

impl Hub {
    pub fn new(
        config: Config,
        db: Database,
        authenticator: Arc<dyn Authenticator>,
        spawners: Arc<dyn SpawnerFactory>,
        proxy: Arc<dyn RouteTable>,
    ) -> anyhow::Result<Arc<Self>> {
        let secret = match config.hub.cookie_secret {
            Some(ref secret) => hex::decode(secret.trim()).context("hub.cookie_secret must be hex")?,
            None => {
                info!("No cookie secret configured, generated a random one");
                new_secret().into_bytes()
            }
        };

        let cookie_cache = CookieCache::new(
            config.hub.cookie_cache_max_entries,
            config.hub.cookie_cache_ttl(),
        );

        Ok(Arc::new(Self {
            cookie_signer: CookieSigner::new(secret),
            cookie_cache,
            config,
            db,
            authenticator,
            spawners,
            proxy,
            users: DashMap::new(),
            services: DashMap::new(),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.config.hub.base_url
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    pub fn proxy(&self) -> &Arc<dyn RouteTable> {
        &self.proxy
    }

    /// Where the proxy sends requests that match no user or service
    pub fn hub_target(&self) -> String {
        format!(
            "http://{}:{}",
            connectable_ip(&self.config.hub.ip),
            self.config.hub.port
        )
    }

    /// Load users, admins, configured tokens and persisted servers
    pub async fn init(&self) -> anyhow::Result<()> {
        for record in self.db.list_users()? {
            let user = User::from_record(&record);
            if let Err(e) = self.authenticator.add_user(&user.name).await {
                warn!(user = %user.name, error = %e, "Authenticator rejected existing user");
            }
            self.insert_slot(user);
        }
        info!(users = self.users.len(), "Loaded users");

        for name in &self.config.hub.admin_users {
            let name = self.authenticator.normalize_username(name);
            match self.users.get(&name).map(|slot| Arc::clone(&slot)) {
                Some(slot) => {
                    if !slot.with_user(|u| std::mem::replace(&mut u.admin, true)) {
                        self.db.set_admin(&name, true)?;
                        info!(user = %name, "Granted admin from configuration");
                    }
                }
                None => {
                    self.create_user(&name, true)
                        .await
                        .with_context(|| format!("Failed to create admin user {}", name))?;
                }
            }
        }

        for (token, owner) in &self.config.hub.api_tokens {
            let owner = self.authenticator.normalize_username(owner);
            if !self.users.contains_key(&owner) {
                self.create_user(&owner, false)
                    .await
                    .with_context(|| format!("Failed to create token owner {}", owner))?;
            }
            match self.user_for_token(token)? {
                Some(principal) if principal.name() == owner => {}
                Some(principal) => anyhow::bail!(
                    "Configured token for {} already belongs to {}",
                    owner,
                    principal.name()
                ),
                None => {
                    self.db.insert_token(&owner, token_prefix(token), &hash_token(token), TOKEN_NOTE_API)?;
                    info!(user = %owner, "Added API token from configuration");
                }
            }
        }

        for record in self.db.list_servers()? {
            let Some(slot) = self.users.get(&record.user_name).map(|s| Arc::clone(&s)) else {
                self.db.delete_server(&record.user_name)?;
                continue;
            };
            let state: Value = serde_json::from_str(&record.state).unwrap_or_else(|_| json!({}));
            slot.spawner.load_state(&state);
            slot.with_user(|u| u.server = Some(Server::from_record(&record)));

            match slot.spawner.poll().await {
                None => info!(user = %record.user_name, "Re-attached to running server"),
                Some(status) => {
                    info!(user = %record.user_name, exit_status = status, "Server exited while the hub was down");
                    self.cleanup_server(&slot).await;
                }
            }
        }

        Ok(())
    }

    fn insert_slot(&self, user: User) -> Arc<UserSlot> {
        let spawner = self.spawners.create(&user.name);
        let name = user.name.clone();
        let slot = UserSlot::new(user, spawner);
        self.users.insert(name, Arc::clone(&slot));
        slot
    }

    fn slot(&self, name: &str) -> HubResult<Arc<UserSlot>> {
        self.users
            .get(name)
            .map(|slot| Arc::clone(&slot))
            .ok_or_else(|| HubError::NotFound(format!("No such user: {}", name)))
    }

    fn slots(&self) -> Vec<Arc<UserSlot>> {
        self.users.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn user_exists(&self, name: &str) -> bool {
        self.users.contains_key(name)
    }

    pub fn get_user(&self, name: &str) -> HubResult<UserModel> {
        Ok(self.slot(name)?.snapshot().to_model())
    }

    pub fn list_users(&self) -> Vec<UserModel> {
        let mut users: Vec<UserModel> = self.slots().iter().map(|s| s.snapshot().to_model()).collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    pub fn spawner_for(&self, name: &str) -> Option<Arc<dyn Spawner>> {
        self.users.get(name).map(|slot| Arc::clone(&slot.spawner))
    }

    pub async fn create_user(&self, name: &str, admin: bool) -> HubResult<UserModel> {
        let name = self.authenticator.normalize_username(name);
        if !self.authenticator.validate_username(&name) {
            return Err(HubError::InvalidInput(format!("Invalid username: {}", name)));
        }
        if self.users.contains_key(&name) {
            return Err(HubError::Conflict(format!("User {} already exists", name)));
        }

        self.authenticator.add_user(&name).await?;

        let user = User::new(&name, admin);
        self.db.create_user(&user.to_record())?;
        let model = user.to_model();
        self.insert_slot(user);

        info!(user = %name, admin, "Created user");
        Ok(model)
    }

    /// Create the subset of `names` that do not exist yet
    pub async fn create_users(&self, names: &[String], admin: bool) -> HubResult<Vec<UserModel>> {
        let mut invalid = Vec::new();
        let mut to_create: Vec<String> = Vec::new();

        for raw in names {
            let name = self.authenticator.normalize_username(raw);
            if !self.authenticator.validate_username(&name) {
                invalid.push(name);
            } else if !self.users.contains_key(&name) && !to_create.contains(&name) {
                to_create.push(name);
            }
        }

        if !invalid.is_empty() {
            return Err(HubError::InvalidInput(format!(
                "Invalid usernames: {}",
                invalid.join(", ")
            )));
        }
        if to_create.is_empty() {
            return Err(HubError::Conflict(format!(
                "All {} users already exist",
                names.len()
            )));
        }

        let mut created = Vec::with_capacity(to_create.len());
        for name in to_create {
            created.push(self.create_user(&name, admin).await?);
        }
        Ok(created)
    }

    /// Change a user's admin flag and/or name. Renaming requires the server
    /// to be stopped.
    pub async fn update_user(
        &self,
        name: &str,
        admin: Option<bool>,
        new_name: Option<&str>,
    ) -> HubResult<UserModel> {
        let slot = self.slot(name)?;
        let mut current = name.to_string();

        if let Some(new_name) = new_name {
            let new_name = self.authenticator.normalize_username(new_name);
            if new_name != name {
                if !self.authenticator.validate_username(&new_name) {
                    return Err(HubError::InvalidInput(format!("Invalid username: {}", new_name)));
                }
                if self.users.contains_key(&new_name) {
                    return Err(HubError::Conflict(format!(
                        "User {} already exists, username must be unique",
                        new_name
                    )));
                }
                if !slot.claim_for_removal()? {
                    return Err(HubError::Conflict(format!(
                        "Cannot rename {} while its server is running",
                        name
                    )));
                }

                let renamed = async {
                    self.authenticator.add_user(&new_name).await?;
                    self.db.rename_user(name, &new_name)?;
                    Ok::<(), HubError>(())
                }
                .await;
                if let Err(e) = renamed {
                    slot.release_claim();
                    return Err(e);
                }
                self.users.remove(name);
                self.authenticator.delete_user(name);
                self.cookie_cache.invalidate_user(name);

                let mut user = slot.snapshot();
                user.name = new_name.clone();
                self.insert_slot(user);
                info!(user = %name, new_name = %new_name, "Renamed user");
                current = new_name;
            }
        }

        if let Some(admin) = admin {
            self.db.set_admin(&current, admin)?;
            self.slot(&current)?.with_user(|u| u.admin = admin);
        }

        self.get_user(&current)
    }

    /// Stop the user's server, then remove every trace of the user
    pub async fn delete_user(self: &Arc<Self>, name: &str) -> HubResult<()> {
        let slot = self.slot(name)?;
        loop {
            match self.stop_and_wait(name).await {
                // raced with an operation admitted after the wait
                Ok(()) | Err(HubError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
            if slot.claim_for_removal()? {
                break;
            }
            debug!(user = %name, "Server started during delete, stopping it again");
        }

        if let Err(e) = self.db.delete_user(name) {
            slot.release_claim();
            return Err(e.into());
        }
        self.users.remove(name);
        self.authenticator.delete_user(name);
        self.cookie_cache.invalidate_user(name);

        info!(user = %name, "Deleted user");
        Ok(())
    }

    /// Longest an operation may legitimately run
    fn op_budget(&self) -> Duration {
        let hub = &self.config.hub;
        hub.start_timeout() + hub.http_timeout() + hub.stop_timeout() + Duration::from_secs(5)
    }

    /// Wait for any in-flight operation, then stop a server if one remains
    async fn stop_and_wait(self: &Arc<Self>, name: &str) -> HubResult<()> {
        let slot = self.slot(name)?;

        if let Some(rx) = slot.op() {
            debug!(user = %name, "Waiting for pending operation");
            if await_outcome(rx, self.op_budget()).await.ok() == Some(OpStatus::Pending) {
                return Err(HubError::Timeout(format!("{} is still pending", name)));
            }
        }

        if slot.snapshot().server.is_none() {
            return Ok(());
        }

        let pending = self.stop_slot(&slot).await? == OpStatus::Pending;
        if pending && self.wait_for_op(name, self.op_budget()).await? == OpStatus::Pending {
            return Err(HubError::Timeout(format!("{}'s server did not stop", name)));
        }
        Ok(())
    }

    /// Wait up to `wait` for the user's in-flight operation, if any
    pub async fn wait_for_op(&self, name: &str, wait: Duration) -> HubResult<OpStatus> {
        match self.slot(name)?.op() {
            Some(rx) => await_outcome(rx, wait).await,
            None => Ok(OpStatus::Complete),
        }
    }

    fn admit(&self, slot: &UserSlot, op: Pending, options: Option<Value>) -> HubResult<Admission> {
        let mut state = slot.state.lock();
        let name = state.user.name.clone();

        if state.removing {
            return Err(HubError::NotFound(format!("No such user: {}", name)));
        }
        if let Some(pending) = state.user.pending {
            if pending == op {
                if let Some(rx) = state.op.clone() {
                    return Ok(Admission::InFlight(rx));
                }
            }
            return Err(HubError::Conflict(format!("{} is pending {}", name, pending.as_str())));
        }

        match op {
            Pending::Spawn => {
                if state.user.server.is_some() {
                    return Err(HubError::Conflict(format!("{}'s server is already running", name)));
                }
                state.user.server = Some(Server::new(&name, &self.config.spawner.ip));
                state.user.user_options = options.unwrap_or_else(|| json!({}));
            }
            Pending::Stop => match state.user.server.as_mut() {
                Some(server) => server.state = ServerState::Stopping,
                None => {
                    return Err(HubError::Conflict(format!("{}'s server is not running", name)));
                }
            },
        }

        state.user.pending = Some(op);
        let (tx, rx) = watch::channel(None);
        state.op = Some(rx.clone());
        Ok(Admission::Started(tx, rx))
    }

    fn finish_op(&self, slot: &UserSlot, tx: watch::Sender<OpOutcome>, result: HubResult<()>) {
        {
            let mut state = slot.state.lock();
            state.user.pending = None;
            state.op = None;
        }
        tx.send_replace(Some(result));
    }

    /// Start the user's server.
    ///
    /// Returns [`OpStatus::Pending`] when the server is still starting after
    /// `slow_spawn_timeout`; the spawn carries on in the background.
    pub async fn spawn(self: &Arc<Self>, name: &str, options: Value) -> HubResult<OpStatus> {
        let slot = self.slot(name)?;
        self.refresh_slot(&slot).await;

        let rx = match self.admit(&slot, Pending::Spawn, Some(options))? {
            Admission::InFlight(rx) => rx,
            Admission::Started(tx, rx) => {
                info!(user = %name, "Spawning server");
                let hub = Arc::clone(self);
                let slot = Arc::clone(&slot);
                tokio::spawn(async move {
                    let result = match hub.start_server(&slot).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            error!(user = %slot.snapshot().name, error = %e, "Spawn failed");
                            hub.cleanup_server(&slot).await;
                            Err(e)
                        }
                    };
                    hub.finish_op(&slot, tx, result);
                });
                rx
            }
        };

        await_outcome(rx, self.config.hub.slow_spawn_timeout()).await
    }

    async fn start_server(&self, slot: &UserSlot) -> HubResult<()> {
        let user = slot.snapshot();
        let name = user.name.clone();
        let server = user
            .server
            .clone()
            .ok_or_else(|| HubError::Internal(anyhow::anyhow!("spawn without a server record")))?;

        if let Some(ref hook) = self.config.spawner.pre_spawn_command {
            if let Err(e) = run_pre_spawn_hook(hook, &name).await {
                error!(user = %name, error = %e, "Pre-spawn hook failed");
                return Err(HubError::Upstream(format!("Pre-spawn hook failed for {}", name)));
            }
        }

        let ctx = SpawnContext {
            user: name.clone(),
            base_url: server.base_url.clone(),
            hub_prefix: self.base_url().to_string(),
            hub_api_url: self.config.hub.api_url(),
            api_token: self.issue_token(&name, TOKEN_NOTE_SERVER)?,
            cookie_name: server.cookie_name.clone(),
            ip: server.ip.clone(),
            port: 0,
            user_options: user.user_options.clone(),
        };

        let start_timeout = self.config.hub.start_timeout();
        let (ip, port) = match tokio::time::timeout(start_timeout, slot.spawner.start(&ctx)).await {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                error!(user = %name, error = %e, "Spawner failed to start server");
                return Err(HubError::Upstream(format!("Failed to start server for {}", name)));
            }
            Err(_) => {
                return Err(HubError::Timeout(format!(
                    "Server for {} didn't start in {} seconds",
                    name,
                    start_timeout.as_secs()
                )));
            }
        };

        let server = slot
            .with_user(|u| {
                let server = u.server.as_mut()?;
                server.ip = ip.clone();
                server.port = port;
                Some(server.clone())
            })
            .ok_or_else(|| HubError::Internal(anyhow::anyhow!("server record vanished during spawn")))?;
        self.db.upsert_server(&server.to_record(&name, &slot.spawner.get_state()))?;
        debug!(user = %name, ip, port, "Server started, waiting for it to accept connections");

        let http_timeout = self.config.hub.http_timeout();
        let backoff = self.config.backoff.with_timeout(http_timeout);
        let spawner: &dyn Spawner = slot.spawner.as_ref();
        let connect_ip = connectable_ip(&ip);
        let message = format!(
            "Server for {} didn't respond in {} seconds",
            name,
            http_timeout.as_secs()
        );
        let reachable = exponential_backoff(&backoff, &message, move || async move {
            if spawner.poll().await.is_some() {
                return Some(false);
            }
            can_connect(connect_ip, port).await.then_some(true)
        })
        .await?;

        if !reachable {
            return Err(HubError::Upstream(format!(
                "Server for {} exited before accepting connections",
                name
            )));
        }

        let target = server.target();
        self.proxy
            .add_route(&server.base_url, &target, route_data("user", name.as_str()))
            .await?;

        slot.with_user(|u| {
            if let Some(server) = u.server.as_mut() {
                server.state = ServerState::Running;
            }
            u.last_activity = Utc::now();
        });
        info!(user = %name, target, "Server ready");
        Ok(())
    }

    /// Tear down whatever a failed or dead server left behind
    async fn cleanup_server(&self, slot: &UserSlot) {
        let user = slot.snapshot();
        let name = user.name.as_str();

        if let Err(e) = slot.spawner.stop(true).await {
            warn!(user = %name, error = %e, "Failed to stop server");
        }
        slot.spawner.clear_state();

        if let Some(ref server) = user.server {
            if let Err(e) = self.proxy.delete_route(&server.base_url).await {
                warn!(user = %name, error = %e, "Failed to remove route");
            }
        }
        if let Err(e) = self.db.delete_server(name) {
            warn!(user = %name, error = %e, "Failed to delete server record");
        }
        if let Err(e) = self.db.delete_tokens(name, TOKEN_NOTE_SERVER) {
            warn!(user = %name, error = %e, "Failed to revoke server tokens");
        }

        slot.with_user(|u| u.server = None);
        self.cookie_cache.invalidate_user(name);
    }

    /// Stop the user's server.
    ///
    /// Returns [`OpStatus::Pending`] when the server is still stopping
    /// after `slow_stop_timeout`.
    pub async fn stop(self: &Arc<Self>, name: &str) -> HubResult<OpStatus> {
        let slot = self.slot(name)?;
        self.refresh_slot(&slot).await;
        self.stop_slot(&slot).await
    }

    async fn stop_slot(self: &Arc<Self>, slot: &Arc<UserSlot>) -> HubResult<OpStatus> {
        let rx = match self.admit(slot, Pending::Stop, None)? {
            Admission::InFlight(rx) => rx,
            Admission::Started(tx, rx) => {
                info!(user = %slot.snapshot().name, "Stopping server");
                let hub = Arc::clone(self);
                let slot = Arc::clone(slot);
                tokio::spawn(async move {
                    let result = hub.stop_server(&slot).await;
                    hub.finish_op(&slot, tx, result);
                });
                rx
            }
        };

        await_outcome(rx, self.config.hub.slow_stop_timeout()).await
    }

    async fn stop_server(&self, slot: &UserSlot) -> HubResult<()> {
        let user = slot.snapshot();
        let name = user.name.as_str();
        let Some(server) = user.server.clone() else {
            return Ok(());
        };

        if let Err(e) = self.proxy.delete_route(&server.base_url).await {
            warn!(user = %name, error = %e, "Failed to remove route, stopping anyway");
        }
        if let Err(e) = slot.spawner.stop(false).await {
            warn!(user = %name, error = %e, "Spawner failed to stop server");
        }

        let stop_timeout = self.config.hub.stop_timeout();
        let backoff = self.config.backoff.with_timeout(stop_timeout);
        let spawner: &dyn Spawner = slot.spawner.as_ref();
        let message = format!(
            "Server for {} didn't stop in {} seconds",
            name,
            stop_timeout.as_secs()
        );

        match exponential_backoff(&backoff, &message, move || async move { spawner.poll().await }).await {
            Ok(status) => {
                slot.spawner.clear_state();
                self.db.delete_server(name)?;
                self.db.delete_tokens(name, TOKEN_NOTE_SERVER)?;
                slot.with_user(|u| u.server = None);
                self.cookie_cache.invalidate_user(name);
                info!(user = %name, exit_status = status, "Server stopped");
                Ok(())
            }
            Err(e) => {
                warn!(user = %name, error = %e, "Server did not stop, leaving it running");
                slot.with_user(|u| {
                    if let Some(server) = u.server.as_mut() {
                        server.state = ServerState::Running;
                    }
                });
                if let Err(route_err) = self
                    .proxy
                    .add_route(&server.base_url, &server.target(), route_data("user", name))
                    .await
                {
                    warn!(user = %name, error = %route_err, "Failed to restore route");
                }
                Err(e)
            }
        }
    }

    /// Clean up after a server that exited on its own
    async fn refresh_slot(&self, slot: &UserSlot) {
        let running = slot.snapshot().running();
        if !running {
            return;
        }

        if let Some(status) = slot.spawner.poll().await {
            if slot.state.lock().user.pending.is_some() {
                return;
            }
            warn!(user = %slot.snapshot().name, exit_status = status, "Server exited unexpectedly");
            self.cleanup_server(slot).await;
        }
    }

    /// Poll every running server, cleaning up those that died
    pub async fn poll_servers(&self) {
        for slot in self.slots() {
            self.refresh_slot(&slot).await;
        }
    }

    /// Make the proxy's routing table agree with the hub's view
    pub async fn check_routes(&self) -> HubResult<()> {
        let routes = self.proxy.get_routes().await?;

        let mut expected: HashMap<String, (String, Map<String, Value>)> = HashMap::new();
        expected.insert("/".to_string(), (self.hub_target(), route_data("hub", true)));

        for service in self.services.iter() {
            if let Some(ref url) = service.url {
                expected.insert(
                    service_prefix(service.key()),
                    (url.clone(), route_data("service", service.key().as_str())),
                );
            }
        }

        let mut in_flight = HashSet::new();
        let mut owners: HashMap<String, Arc<UserSlot>> = HashMap::new();
        for slot in self.slots() {
            let user = slot.snapshot();
            let Some(ref server) = user.server else {
                continue;
            };
            let prefix = normalize_prefix(&server.base_url);
            if user.running() {
                expected.insert(prefix.clone(), (server.target(), route_data("user", user.name.as_str())));
                owners.insert(prefix, slot);
            } else {
                in_flight.insert(prefix);
            }
        }

        for (prefix, (target, data)) in &expected {
            match routes.get(prefix) {
                Some(route) if route.target == *target => continue,
                Some(route) => {
                    warn!(prefix, found = %route.target, expected = %target, "Updating route with wrong target");
                }
                None => info!(prefix, target, "Adding missing route"),
            }

            // A stop admitted since the snapshot owns this route now
            let owner = owners.get(prefix);
            if owner.is_some_and(|slot| !slot.snapshot().running()) {
                debug!(prefix, "Server no longer running, skipping route");
                continue;
            }
            self.proxy.add_route(prefix, target, data.clone()).await?;
            if owner.is_some_and(|slot| !slot.snapshot().running()) {
                debug!(prefix, "Server stopped while adding route, removing it");
                self.proxy.delete_route(prefix).await?;
            }
        }

        for prefix in routes.keys() {
            if prefix == "/" || expected.contains_key(prefix) || in_flight.contains(prefix) {
                continue;
            }
            if self.config.hub.prune_orphan_routes {
                info!(prefix, "Pruning orphaned route");
                self.proxy.delete_route(prefix).await?;
            } else {
                debug!(prefix, "Leaving route the hub does not own");
            }
        }

        Ok(())
    }

    /// Copy per-route activity from the proxy into users
    pub async fn update_last_activity(&self) -> HubResult<()> {
        let routes = self.proxy.get_routes().await?;

        for route in routes.values() {
            let Some(name) = route.data.get("user").and_then(Value::as_str) else {
                continue;
            };
            let Some(ts) = route
                .data
                .get("last_activity")
                .and_then(Value::as_str)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            else {
                continue;
            };
            let Some(slot) = self.users.get(name).map(|s| Arc::clone(&s)) else {
                continue;
            };

            let ts = ts.with_timezone(&Utc);
            let newer = slot.with_user(|u| {
                if ts > u.last_activity {
                    u.last_activity = ts;
                    true
                } else {
                    false
                }
            });
            if newer {
                self.db.set_last_activity(name, &ts.to_rfc3339())?;
            }
        }
        Ok(())
    }

    /// Register a service; `token` lets it call the API as itself
    pub fn register_service(&self, name: &str, url: Option<String>, admin: bool, token: Option<&str>) {
        self.services.insert(
            name.to_string(),
            ServiceEntry {
                url,
                admin,
                hashed_token: token.map(hash_token),
            },
        );
        info!(service = name, admin, "Registered service");
    }

    pub fn issue_token(&self, name: &str, note: &str) -> HubResult<String> {
        let token = new_token();
        self.db.insert_token(name, token_prefix(&token), &hash_token(&token), note)?;
        Ok(token)
    }

    pub fn user_for_token(&self, token: &str) -> HubResult<Option<Principal>> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(None);
        }

        for record in self.db.find_tokens_by_prefix(token_prefix(token))? {
            if !compare_token(&record.hashed, token) {
                continue;
            }
            self.db.touch_token(record.id)?;
            let admin = self.users.get(&record.user_name).map(|slot| slot.snapshot().admin);
            return Ok(admin.map(|admin| Principal::User {
                name: record.user_name,
                admin,
            }));
        }

        for service in self.services.iter() {
            if let Some(ref hashed) = service.hashed_token {
                if compare_token(hashed, token) {
                    return Ok(Some(Principal::Service {
                        name: service.key().clone(),
                        admin: service.admin,
                    }));
                }
            }
        }

        Ok(None)
    }

    /// Resolve a signed hub or server cookie to its user
    pub fn user_for_cookie(&self, cookie_name: &str, value: &str) -> Option<UserModel> {
        let key = format!("{}={}", cookie_name, value);
        if let Some(name) = self.cookie_cache.get(&key) {
            if let Ok(model) = self.get_user(&name) {
                return Some(model);
            }
            self.cookie_cache.invalidate(&key);
            return None;
        }

        let max_age = self.config.hub.cookie_max_age();
        let (user, signed_at) = if cookie_name == HUB_COOKIE_NAME {
            let (cookie_id, signed_at) = self.cookie_signer.verify_timestamped(cookie_name, value, max_age)?;
            let user = self
                .slots()
                .into_iter()
                .map(|slot| slot.snapshot())
                .find(|u| u.cookie_id == cookie_id)?;
            (user, signed_at)
        } else {
            let user = self
                .slots()
                .into_iter()
                .map(|slot| slot.snapshot())
                .find(|u| u.server.as_ref().is_some_and(|s| s.cookie_name == cookie_name))?;
            let server = user.server.as_ref()?;
            let (cookie_id, signed_at) =
                CookieSigner::new(server.cookie_secret.as_bytes()).verify_timestamped(cookie_name, value, max_age)?;
            if cookie_id != user.cookie_id {
                return None;
            }
            (user, signed_at)
        };

        // Cached entries must not outlive the signature
        let remaining = signed_at + max_age.as_secs() as i64 - Utc::now().timestamp();
        if remaining > 0 {
            let deadline = Instant::now() + Duration::from_secs(remaining as u64);
            self.cookie_cache
                .insert_until(key, user.name.clone(), user.name.clone(), deadline);
        }
        Some(user.to_model())
    }

    pub fn hub_cookie(&self, name: &str) -> HubResult<CookieGrant> {
        let user = self.slot(name)?.snapshot();
        Ok(CookieGrant {
            name: HUB_COOKIE_NAME.to_string(),
            value: self.cookie_signer.sign(HUB_COOKIE_NAME, &user.cookie_id),
            path: self.base_url().to_string(),
        })
    }

    /// Cookie for the user's own server, if it has one
    pub fn server_cookie(&self, name: &str) -> Option<CookieGrant> {
        let user = self.slot(name).ok()?.snapshot();
        let server = user.server?;
        let value = CookieSigner::new(server.cookie_secret.as_bytes()).sign(&server.cookie_name, &user.cookie_id);
        Some(CookieGrant {
            name: server.cookie_name,
            value,
            path: server.base_url,
        })
    }

    async fn authenticate(&self, credentials: &Credentials) -> HubResult<String> {
        let Some(name) = self.authenticator.authenticate(credentials).await? else {
            warn!(user = %credentials.username, "Failed login");
            return Err(HubError::AuthFailure("Invalid username or password".to_string()));
        };
        if !self.users.contains_key(&name) {
            self.create_user(&name, false).await?;
        }
        Ok(name)
    }

    /// Check credentials, creating the user on first login, and return the
    /// cookies to set
    pub async fn login(&self, credentials: &Credentials) -> HubResult<(UserModel, Vec<CookieGrant>)> {
        let name = self.authenticate(credentials).await?;
        let mut cookies = vec![self.hub_cookie(&name)?];
        cookies.extend(self.server_cookie(&name));
        info!(user = %name, "User logged in");
        Ok((self.get_user(&name)?, cookies))
    }

    /// Exchange credentials for a new API token
    pub async fn token_login(&self, credentials: &Credentials) -> HubResult<String> {
        let name = self.authenticate(credentials).await?;
        self.issue_token(&name, TOKEN_NOTE_API)
    }

    /// Invalidate every cookie issued to the user; returns the cookies to clear
    pub fn logout(&self, name: &str) -> HubResult<Vec<CookieGrant>> {
        let slot = self.slot(name)?;
        let cookie_id = new_cookie_id();
        self.db.set_cookie_id(name, &cookie_id)?;
        let user = slot.with_user(|u| {
            u.cookie_id = cookie_id;
            u.clone()
        });
        self.cookie_cache.invalidate_user(name);

        let mut cleared = vec![CookieGrant {
            name: HUB_COOKIE_NAME.to_string(),
            value: String::new(),
            path: self.base_url().to_string(),
        }];
        if let Some(server) = user.server {
            cleared.push(CookieGrant {
                name: server.cookie_name,
                value: String::new(),
                path: server.base_url,
            });
        }
        info!(user = %name, "User logged out");
        Ok(cleared)
    }

    /// URL of a user's server as seen through the proxy
    pub fn server_url(&self, name: &str) -> Option<String> {
        let user = self.slot(name).ok()?.snapshot();
        if user.running() {
            user.server.map(|s| url_path_join(&[&s.base_url, "/"]))
        } else {
            None
        }
    }

    /// Stop every server, for hub shutdown
    pub async fn stop_all_servers(self: &Arc<Self>) {
        let names: Vec<String> = self
            .slots()
            .iter()
            .filter(|slot| slot.busy())
            .map(|slot| slot.snapshot().name)
            .collect();
        if names.is_empty() {
            return;
        }

        info!(servers = names.len(), "Stopping all servers");
        let stops = names.iter().map(|name| async move {
            if let Err(e) = self.stop_and_wait(name).await {
                warn!(user = %name, error = %e, "Failed to stop server during shutdown");
            }
        });
        futures::future::join_all(stops).await;
    }
}
