//! Authenticator capability and backends
//!
//! An [`Authenticator`] turns credentials into a username. Every backend
//! shares an [`AccessPolicy`] (whitelist, group whitelist, username pattern)
//! and may require a matching OS account through [`LocalAccounts`].

use crate::config::{AuthenticatorConfig, AuthenticatorKind};
use crate::error::{HubError, HubResult};
use crate::token::compare_token;
use crate::utils::url_path_join;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Username and password submitted to log in
#[derive(Clone, Deserialize, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Resolves the members of an OS group
pub type GroupLookup = Box<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Who may log in, and what a valid username looks like
pub struct AccessPolicy {
    whitelist: RwLock<HashSet<String>>,
    group_whitelist: Vec<String>,
    username_pattern: Option<Regex>,
    group_members: GroupLookup,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            whitelist: RwLock::new(HashSet::new()),
            group_whitelist: Vec::new(),
            username_pattern: None,
            group_members: Box::new(system_group_members),
        }
    }
}

impl AccessPolicy {
    pub fn new(
        whitelist: &[String],
        group_whitelist: &[String],
        username_pattern: &str,
    ) -> anyhow::Result<Self> {
        if !whitelist.is_empty() && !group_whitelist.is_empty() {
            warn!("Ignoring username whitelist because group whitelist supplied");
        }

        let username_pattern = if username_pattern.is_empty() {
            None
        } else {
            Some(Regex::new(&format!("^(?:{})$", username_pattern))?)
        };

        Ok(Self {
            whitelist: RwLock::new(whitelist.iter().map(|n| normalize_username(n)).collect()),
            group_whitelist: group_whitelist.to_vec(),
            username_pattern,
            group_members: Box::new(system_group_members),
        })
    }

    /// Replace the OS group lookup
    pub fn with_group_lookup(mut self, lookup: GroupLookup) -> Self {
        self.group_members = lookup;
        self
    }

    pub fn check_whitelist(&self, username: &str) -> bool {
        if !self.group_whitelist.is_empty() {
            return self
                .group_whitelist
                .iter()
                .any(|group| (self.group_members)(group).iter().any(|m| m == username));
        }

        let whitelist = self.whitelist.read();
        whitelist.is_empty() || whitelist.contains(username)
    }

    pub fn validate_username(&self, username: &str) -> bool {
        if username.is_empty() || username.contains('/') {
            return false;
        }
        match self.username_pattern {
            Some(ref pattern) => pattern.is_match(username),
            None => true,
        }
    }

    /// Add `username` to a non-empty whitelist
    pub fn admit(&self, username: &str) {
        let mut whitelist = self.whitelist.write();
        if !whitelist.is_empty() {
            whitelist.insert(username.to_string());
        }
    }

    pub fn remove(&self, username: &str) {
        self.whitelist.write().remove(username);
    }

    pub fn whitelist(&self) -> Vec<String> {
        let mut names: Vec<String> = self.whitelist.read().iter().cloned().collect();
        names.sort();
        names
    }
}

pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

/// Pluggable credential check
///
/// Implementors provide [`check_credentials`](Authenticator::check_credentials)
/// and their [`AccessPolicy`]; everything else has a default that backends
/// may override (an external login flow overrides `login_url`, a backend
/// tied to OS accounts overrides `add_user`).
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Backend-specific credential check, returning the authenticated name
    async fn check_credentials(&self, credentials: &Credentials) -> HubResult<Option<String>>;

    fn policy(&self) -> &AccessPolicy;

    /// Return the normalized username for valid, whitelisted credentials.
    /// Rejection has no side effects.
    async fn authenticate(&self, credentials: &Credentials) -> HubResult<Option<String>> {
        let username = self.normalize_username(&credentials.username);
        if username.is_empty() || !self.check_whitelist(&username) {
            debug!(user = %username, "Rejected login for user not in whitelist");
            return Ok(None);
        }

        let normalized = Credentials {
            username,
            password: credentials.password.clone(),
        };
        let Some(name) = self.check_credentials(&normalized).await? else {
            return Ok(None);
        };

        // The backend may answer with a different identity than was submitted
        let name = self.normalize_username(&name);
        if name.is_empty() || !self.check_whitelist(&name) {
            debug!(user = %name, "Rejected login for backend identity not in whitelist");
            return Ok(None);
        }
        Ok(Some(name))
    }

    fn check_whitelist(&self, username: &str) -> bool {
        self.policy().check_whitelist(username)
    }

    fn normalize_username(&self, username: &str) -> String {
        normalize_username(username)
    }

    fn validate_username(&self, username: &str) -> bool {
        self.policy().validate_username(username)
    }

    /// Called when the hub creates a user
    async fn add_user(&self, username: &str) -> HubResult<()> {
        self.policy().admit(username);
        Ok(())
    }

    /// Called when the hub deletes a user. Never removes system accounts.
    fn delete_user(&self, username: &str) {
        self.policy().remove(username);
    }

    fn login_url(&self, base_url: &str) -> String {
        url_path_join(&[base_url, "login"])
    }

    fn logout_url(&self, base_url: &str) -> String {
        url_path_join(&[base_url, "logout"])
    }
}

/// Requires (and optionally creates) an OS account for every hub user
#[derive(Debug, Clone, Default)]
pub struct LocalAccounts {
    pub create_system_users: bool,
}

impl LocalAccounts {
    pub async fn ensure_user(&self, username: &str) -> HubResult<()> {
        if system_user_exists(username) {
            return Ok(());
        }
        if !self.create_system_users {
            return Err(HubError::UnknownUser(username.to_string()));
        }
        create_system_user(username).await
    }
}

static PASSWD_LOOKUP: Mutex<()> = Mutex::new(());

#[cfg(unix)]
fn system_group_members(group: &str) -> Vec<String> {
    use std::ffi::{CStr, CString};

    let Ok(name) = CString::new(group) else {
        return Vec::new();
    };

    // getgrnam returns a pointer into static storage
    let _guard = PASSWD_LOOKUP.lock();
    let mut members = Vec::new();
    unsafe {
        let entry = libc::getgrnam(name.as_ptr());
        if entry.is_null() {
            return members;
        }
        let mut member = (*entry).gr_mem;
        while !member.is_null() && !(*member).is_null() {
            members.push(CStr::from_ptr(*member).to_string_lossy().into_owned());
            member = member.add(1);
        }
    }
    members
}

#[cfg(not(unix))]
fn system_group_members(_group: &str) -> Vec<String> {
    Vec::new()
}

#[cfg(unix)]
pub fn system_user_exists(username: &str) -> bool {
    let Ok(name) = std::ffi::CString::new(username) else {
        return false;
    };
    let _guard = PASSWD_LOOKUP.lock();
    unsafe { !libc::getpwnam(name.as_ptr()).is_null() }
}

#[cfg(not(unix))]
pub fn system_user_exists(_username: &str) -> bool {
    false
}

async fn create_system_user(username: &str) -> HubResult<()> {
    // BSD ships `pw`, Linux ships `useradd`
    let mut cmd = if std::path::Path::new("/usr/sbin/pw").exists() {
        let mut cmd = tokio::process::Command::new("pw");
        cmd.args(["useradd", username, "-m"]);
        cmd
    } else {
        let mut cmd = tokio::process::Command::new("useradd");
        cmd.args(["-m", username]);
        cmd
    };

    info!(user = %username, "Creating system user");
    let output = cmd
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run useradd for {}: {}", username, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HubError::Internal(anyhow::anyhow!(
            "Failed to create system user {}: {}",
            username,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Checks passwords against hashes from the configuration file
pub struct PasswordAuthenticator {
    policy: AccessPolicy,
    users: HashMap<String, String>,
    local_accounts: Option<LocalAccounts>,
}

impl PasswordAuthenticator {
    pub fn new(policy: AccessPolicy, users: HashMap<String, String>) -> Self {
        Self {
            policy,
            users: users
                .into_iter()
                .map(|(name, hash)| (normalize_username(&name), hash))
                .collect(),
            local_accounts: None,
        }
    }

    pub fn with_local_accounts(mut self, local: LocalAccounts) -> Self {
        self.local_accounts = Some(local);
        self
    }
}

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    async fn check_credentials(&self, credentials: &Credentials) -> HubResult<Option<String>> {
        let Some(hashed) = self.users.get(&credentials.username) else {
            return Ok(None);
        };
        if compare_token(hashed, &credentials.password) {
            Ok(Some(credentials.username.clone()))
        } else {
            Ok(None)
        }
    }

    fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    async fn add_user(&self, username: &str) -> HubResult<()> {
        if let Some(ref local) = self.local_accounts {
            local.ensure_user(username).await?;
        }
        self.policy.admit(username);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RemoteIdentity {
    name: String,
}

/// Delegates credential checks to an HTTP endpoint.
///
/// The endpoint receives `{"username", "password"}` and answers `200
/// {"name": ...}` to accept or 401/403 to reject.
pub struct RemoteAuthenticator {
    policy: AccessPolicy,
    client: reqwest::Client,
    url: String,
    login_url: Option<String>,
    logout_url: Option<String>,
}

impl RemoteAuthenticator {
    pub fn new(policy: AccessPolicy, url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            policy,
            client,
            url: url.into(),
            login_url: None,
            logout_url: None,
        })
    }

    pub fn with_external_urls(mut self, login_url: Option<String>, logout_url: Option<String>) -> Self {
        self.login_url = login_url;
        self.logout_url = logout_url;
        self
    }
}

#[async_trait]
impl Authenticator for RemoteAuthenticator {
    async fn check_credentials(&self, credentials: &Credentials) -> HubResult<Option<String>> {
        let response = self
            .client
            .post(&self.url)
            .json(credentials)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %self.url, error = %e, "Authentication backend unreachable");
                HubError::Upstream("Authentication backend unavailable".to_string())
            })?;

        match response.status().as_u16() {
            200 => {
                let identity: RemoteIdentity = response.json().await.map_err(|e| {
                    warn!(url = %self.url, error = %e, "Malformed authentication response");
                    HubError::Upstream("Malformed response from authentication backend".to_string())
                })?;
                Ok(Some(identity.name))
            }
            401 | 403 => Ok(None),
            status => {
                warn!(url = %self.url, status, "Authentication backend error");
                Err(HubError::Upstream(format!(
                    "Authentication backend returned {}",
                    status
                )))
            }
        }
    }

    fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    fn login_url(&self, base_url: &str) -> String {
        self.login_url
            .clone()
            .unwrap_or_else(|| url_path_join(&[base_url, "login"]))
    }

    fn logout_url(&self, base_url: &str) -> String {
        self.logout_url
            .clone()
            .unwrap_or_else(|| url_path_join(&[base_url, "logout"]))
    }
}

/// Build the configured authenticator
pub fn from_config(config: &AuthenticatorConfig) -> anyhow::Result<Arc<dyn Authenticator>> {
    let policy = AccessPolicy::new(
        &config.whitelist,
        &config.group_whitelist,
        &config.username_pattern,
    )?;

    let authenticator: Arc<dyn Authenticator> = match config.kind {
        AuthenticatorKind::Password => {
            let mut auth = PasswordAuthenticator::new(policy, config.users.clone());
            if config.local_accounts {
                auth = auth.with_local_accounts(LocalAccounts {
                    create_system_users: config.create_system_users,
                });
            }
            Arc::new(auth)
        }
        AuthenticatorKind::Remote => {
            let url = config
                .url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("Remote authenticator requires 'url'"))?;
            Arc::new(
                RemoteAuthenticator::new(policy, url)?
                    .with_external_urls(config.login_url.clone(), config.logout_url.clone()),
            )
        }
    };

    Ok(authenticator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::hash_token;

    fn creds(username: &str, password: &str) -> Credentials {
        Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_whitelist_admits_everyone() {
        let policy = AccessPolicy::default();
        assert!(policy.check_whitelist("anyone"));
    }

    #[test]
    fn test_whitelist() {
        let policy = AccessPolicy::new(&names(&["River", "lake"]), &[], "").unwrap();
        assert!(policy.check_whitelist("river"));
        assert!(policy.check_whitelist("lake"));
        assert!(!policy.check_whitelist("ocean"));

        policy.admit("ocean");
        assert!(policy.check_whitelist("ocean"));

        policy.remove("river");
        assert!(!policy.check_whitelist("river"));
        assert_eq!(policy.whitelist(), vec!["lake", "ocean"]);
    }

    #[test]
    fn test_admit_keeps_empty_whitelist_open() {
        let policy = AccessPolicy::default();
        policy.admit("river");
        assert!(policy.whitelist().is_empty());
        assert!(policy.check_whitelist("lake"));
    }

    #[test]
    fn test_group_whitelist_takes_precedence() {
        let policy = AccessPolicy::new(&names(&["river"]), &names(&["staff"]), "")
            .unwrap()
            .with_group_lookup(Box::new(|group| {
                if group == "staff" {
                    vec!["lake".to_string()]
                } else {
                    Vec::new()
                }
            }));

        assert!(policy.check_whitelist("lake"));
        assert!(!policy.check_whitelist("river"));
    }

    #[test]
    fn test_validate_username() {
        let open = AccessPolicy::default();
        assert!(open.validate_username("river"));
        assert!(open.validate_username("Any Thing"));
        assert!(!open.validate_username(""));
        assert!(!open.validate_username("a/b"));

        let strict = AccessPolicy::new(&[], &[], "[a-z][a-z0-9]*").unwrap();
        assert!(strict.validate_username("river2"));
        assert!(!strict.validate_username("2river"));
        assert!(!strict.validate_username("river!"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(AccessPolicy::new(&[], &[], "([").is_err());
    }

    #[test]
    fn test_normalize_username() {
        assert_eq!(normalize_username("  River "), "river");
    }

    #[tokio::test]
    async fn test_password_authenticator() {
        let mut users = HashMap::new();
        users.insert("River".to_string(), hash_token("correct horse"));
        let auth = PasswordAuthenticator::new(AccessPolicy::default(), users);

        assert_eq!(
            auth.authenticate(&creds("river", "correct horse")).await.unwrap().as_deref(),
            Some("river")
        );
        assert_eq!(
            auth.authenticate(&creds("RIVER", "correct horse")).await.unwrap().as_deref(),
            Some("river")
        );
        assert!(auth.authenticate(&creds("river", "wrong")).await.unwrap().is_none());
        assert!(auth.authenticate(&creds("lake", "correct horse")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_whitelist_checked_before_credentials() {
        let mut users = HashMap::new();
        users.insert("river".to_string(), hash_token("pw"));
        let policy = AccessPolicy::new(&names(&["lake"]), &[], "").unwrap();
        let auth = PasswordAuthenticator::new(policy, users);

        assert!(auth.authenticate(&creds("river", "pw")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_and_delete_user() {
        let policy = AccessPolicy::new(&names(&["lake"]), &[], "").unwrap();
        let auth = PasswordAuthenticator::new(policy, HashMap::new());

        auth.add_user("river").await.unwrap();
        assert!(auth.check_whitelist("river"));

        auth.delete_user("river");
        assert!(!auth.check_whitelist("river"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_accounts_unknown_user() {
        let auth = PasswordAuthenticator::new(AccessPolicy::default(), HashMap::new())
            .with_local_accounts(LocalAccounts::default());

        let err = auth.add_user("dne-no-such-account-xyz").await.unwrap_err();
        assert!(matches!(err, HubError::UnknownUser(ref name) if name == "dne-no-such-account-xyz"));

        // root exists on every unix system
        auth.add_user("root").await.unwrap();
    }

    #[test]
    fn test_login_urls() {
        let auth = PasswordAuthenticator::new(AccessPolicy::default(), HashMap::new());
        assert_eq!(auth.login_url("/hub/"), "/hub/login");
        assert_eq!(auth.logout_url("/hub/"), "/hub/logout");

        let remote = RemoteAuthenticator::new(AccessPolicy::default(), "http://127.0.0.1:1/check")
            .unwrap()
            .with_external_urls(Some("https://sso.example.com/login".to_string()), None);
        assert_eq!(remote.login_url("/hub/"), "https://sso.example.com/login");
        assert_eq!(remote.logout_url("/hub/"), "/hub/logout");
    }

    /// Answer every request with `status_line` and `body`, after reading the
    /// whole request
    async fn serve_auth_backend(status_line: &'static str, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let Ok(n) = stream.read(&mut buf).await else {
                        break;
                    };
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request).to_string();
                    if let Some(end) = text.find("\r\n\r\n") {
                        let length = text[..end]
                            .lines()
                            .filter_map(|line| line.split_once(':'))
                            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if request.len() >= end + 4 + length {
                            break;
                        }
                    }
                }
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://127.0.0.1:{}/check", port)
    }

    #[tokio::test]
    async fn test_remote_backend_accepts() {
        let url = serve_auth_backend("200 OK", r#"{"name": "River"}"#).await;
        let remote = RemoteAuthenticator::new(AccessPolicy::default(), url).unwrap();

        assert_eq!(
            remote.authenticate(&creds("river", "pw")).await.unwrap().as_deref(),
            Some("river")
        );
    }

    #[tokio::test]
    async fn test_remote_backend_rejects() {
        for status_line in ["401 Unauthorized", "403 Forbidden"] {
            let url = serve_auth_backend(status_line, "{}").await;
            let remote = RemoteAuthenticator::new(AccessPolicy::default(), url).unwrap();
            assert!(remote.authenticate(&creds("river", "pw")).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_remote_backend_error_is_upstream() {
        let url = serve_auth_backend("500 Internal Server Error", "{}").await;
        let remote = RemoteAuthenticator::new(AccessPolicy::default(), url).unwrap();
        let err = remote.authenticate(&creds("river", "pw")).await.unwrap_err();
        assert!(matches!(err, HubError::Upstream(_)));

        let url = serve_auth_backend("200 OK", "not json").await;
        let remote = RemoteAuthenticator::new(AccessPolicy::default(), url).unwrap();
        let err = remote.authenticate(&creds("river", "pw")).await.unwrap_err();
        assert!(matches!(err, HubError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_remote_identity_must_be_whitelisted() {
        let url = serve_auth_backend("200 OK", r#"{"name": "mallory"}"#).await;
        let policy = AccessPolicy::new(&names(&["river"]), &[], "").unwrap();
        let remote = RemoteAuthenticator::new(policy, url).unwrap();

        assert!(remote.authenticate(&creds("river", "pw")).await.unwrap().is_none());
        assert!(!remote.check_whitelist("mallory"));
        assert_eq!(remote.policy().whitelist(), vec!["river"]);
    }

    #[tokio::test]
    async fn test_remote_backend_unreachable() {
        let port = crate::utils::random_port().unwrap();
        let remote = RemoteAuthenticator::new(
            AccessPolicy::default(),
            format!("http://127.0.0.1:{}/check", port),
        )
        .unwrap();

        let err = remote.authenticate(&creds("river", "pw")).await.unwrap_err();
        assert!(matches!(err, HubError::Upstream(_)));
    }

    #[test]
    fn test_from_config() {
        let config = AuthenticatorConfig {
            kind: AuthenticatorKind::Remote,
            url: Some("http://127.0.0.1:9/auth".to_string()),
            login_url: Some("https://sso/login".to_string()),
            ..Default::default()
        };
        let auth = from_config(&config).unwrap();
        assert_eq!(auth.login_url("/hub/"), "https://sso/login");

        let auth = from_config(&AuthenticatorConfig::default()).unwrap();
        assert_eq!(auth.login_url("/hub/"), "/hub/login");
    }
}
