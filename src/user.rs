//! User and server data model

use crate::db::{ServerRecord, UserRecord};
use crate::token::new_secret;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle transition in flight for a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pending {
    Spawn,
    Stop,
}

impl Pending {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pending::Spawn => "spawn",
            Pending::Stop => "stop",
        }
    }
}

/// State of a user's server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Spawning,
    Running,
    Stopping,
}

/// A user's server: where it is routed and how its cookies are signed
#[derive(Debug, Clone)]
pub struct Server {
    pub base_url: String,
    pub ip: String,
    pub port: u16,
    pub cookie_name: String,
    pub cookie_secret: String,
    pub state: ServerState,
    pub started_at: DateTime<Utc>,
}

impl Server {
    /// A fresh server record for `user_name`, not yet bound to a port
    pub fn new(user_name: &str, ip: &str) -> Self {
        Self {
            base_url: user_base_url(user_name),
            ip: ip.to_string(),
            port: 0,
            cookie_name: server_cookie_name(user_name),
            cookie_secret: new_secret(),
            state: ServerState::Spawning,
            started_at: Utc::now(),
        }
    }

    /// Proxy target of this server
    pub fn target(&self) -> String {
        format!("http://{}:{}", crate::utils::connectable_ip(&self.ip), self.port)
    }

    pub fn to_record(&self, user_name: &str, spawner_state: &serde_json::Value) -> ServerRecord {
        ServerRecord {
            user_name: user_name.to_string(),
            base_url: self.base_url.clone(),
            ip: self.ip.clone(),
            port: self.port,
            cookie_name: self.cookie_name.clone(),
            cookie_secret: self.cookie_secret.clone(),
            state: spawner_state.to_string(),
            started_at: self.started_at.to_rfc3339(),
        }
    }

    /// Rebuild a persisted server; it is only known to be running once polled
    pub fn from_record(record: &ServerRecord) -> Self {
        Self {
            base_url: record.base_url.clone(),
            ip: record.ip.clone(),
            port: record.port,
            cookie_name: record.cookie_name.clone(),
            cookie_secret: record.cookie_secret.clone(),
            state: ServerState::Running,
            started_at: parse_timestamp(&record.started_at),
        }
    }
}

/// A hub user
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub admin: bool,
    pub cookie_id: String,
    pub last_activity: DateTime<Utc>,
    pub server: Option<Server>,
    pub pending: Option<Pending>,
    /// Options passed to the most recent spawn
    pub user_options: serde_json::Value,
}

impl User {
    pub fn new(name: &str, admin: bool) -> Self {
        Self {
            name: name.to_string(),
            admin,
            cookie_id: new_cookie_id(),
            last_activity: Utc::now(),
            server: None,
            pending: None,
            user_options: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn from_record(record: &UserRecord) -> Self {
        Self {
            name: record.name.clone(),
            admin: record.admin,
            cookie_id: record.cookie_id.clone(),
            last_activity: parse_timestamp(&record.last_activity),
            server: None,
            pending: None,
            user_options: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn to_record(&self) -> UserRecord {
        UserRecord {
            name: self.name.clone(),
            admin: self.admin,
            cookie_id: self.cookie_id.clone(),
            last_activity: self.last_activity.to_rfc3339(),
            created_at: String::new(),
        }
    }

    /// A server exists, has finished spawning and is not being stopped
    pub fn running(&self) -> bool {
        self.pending.is_none()
            && self
                .server
                .as_ref()
                .is_some_and(|s| s.state == ServerState::Running)
    }

    pub fn to_model(&self) -> UserModel {
        UserModel {
            name: self.name.clone(),
            admin: self.admin,
            server: if self.running() {
                self.server.as_ref().map(|s| s.base_url.clone())
            } else {
                None
            },
            pending: self.pending,
            last_activity: self.last_activity,
        }
    }
}

/// The JSON view of a user returned by the API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserModel {
    pub name: String,
    pub admin: bool,
    /// Base URL of the running server, if any
    pub server: Option<String>,
    pub pending: Option<Pending>,
    pub last_activity: DateTime<Utc>,
}

pub fn user_base_url(user_name: &str) -> String {
    format!("/user/{}", urlencoding::encode(user_name))
}

pub fn server_cookie_name(user_name: &str) -> String {
    format!("spawnhub-user-{}", urlencoding::encode(user_name))
}

pub fn new_cookie_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite's datetime('now') format
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").map(|t| t.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}
