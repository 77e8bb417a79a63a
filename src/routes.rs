//! Proxy routing table capability
//!
//! The routing table maps url-path prefixes to targets. It is owned by the
//! proxy, which may restart or be edited out of band, so the hub treats it
//! as a separate source of truth: every mutation is idempotent and the hub
//! reconciles against [`RouteTable::get_routes`] rather than trusting its
//! own memory.

use crate::error::{HubError, HubResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A routing table entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    /// Where matching requests are forwarded, e.g. `http://127.0.0.1:5000`
    pub target: String,
    /// Free-form metadata: `{"user": name}`, `{"service": name}`, `{"hub": true}`
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

pub type RouteMap = BTreeMap<String, Route>;

/// Leading `/`, no trailing `/` except for the root route
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Idempotent access to a proxy's routing table
#[async_trait]
pub trait RouteTable: Send + Sync {
    async fn get_routes(&self) -> HubResult<RouteMap>;

    /// Add or replace the route for `prefix`
    async fn add_route(&self, prefix: &str, target: &str, data: Map<String, Value>) -> HubResult<()>;

    /// Remove the route for `prefix`; removing a missing route succeeds
    async fn delete_route(&self, prefix: &str) -> HubResult<()>;
}

struct RouteEntry {
    route: Route,
    last_activity: DateTime<Utc>,
}

/// In-memory routing table shared with the built-in proxy
#[derive(Default)]
pub struct RoutingTable {
    routes: RwLock<BTreeMap<String, RouteEntry>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, prefix: &str, route: Route) {
        let prefix = normalize_prefix(prefix);
        debug!(prefix, target = %route.target, "Route added");
        self.routes.write().insert(
            prefix,
            RouteEntry {
                route,
                last_activity: Utc::now(),
            },
        );
    }

    pub fn remove(&self, prefix: &str) -> bool {
        let prefix = normalize_prefix(prefix);
        let removed = self.routes.write().remove(&prefix).is_some();
        if removed {
            debug!(prefix, "Route removed");
        }
        removed
    }

    /// Routes with their `last_activity` folded into the metadata
    pub fn snapshot(&self) -> RouteMap {
        self.routes
            .read()
            .iter()
            .map(|(prefix, entry)| {
                let mut route = entry.route.clone();
                route.data.insert(
                    "last_activity".to_string(),
                    Value::String(entry.last_activity.to_rfc3339()),
                );
                (prefix.clone(), route)
            })
            .collect()
    }

    /// Longest matching prefix for `path`, on `/` boundaries
    pub fn lookup(&self, path: &str) -> Option<(String, String)> {
        let routes = self.routes.read();
        let mut candidate = normalize_prefix(path);

        loop {
            if let Some(entry) = routes.get(&candidate) {
                return Some((candidate, entry.route.target.clone()));
            }
            if candidate == "/" {
                return None;
            }
            candidate = match candidate.rsplit_once('/') {
                Some(("", _)) | None => "/".to_string(),
                Some((parent, _)) => parent.to_string(),
            };
        }
    }

    /// Record traffic through `prefix`
    pub fn touch(&self, prefix: &str) {
        if let Some(entry) = self.routes.write().get_mut(prefix) {
            entry.last_activity = Utc::now();
        }
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RouteTable for RoutingTable {
    async fn get_routes(&self) -> HubResult<RouteMap> {
        Ok(self.snapshot())
    }

    async fn add_route(&self, prefix: &str, target: &str, data: Map<String, Value>) -> HubResult<()> {
        self.insert(
            prefix,
            Route {
                target: target.to_string(),
                data,
            },
        );
        Ok(())
    }

    async fn delete_route(&self, prefix: &str) -> HubResult<()> {
        self.remove(prefix);
        Ok(())
    }
}

/// Client for an external proxy's REST routing API
///
/// `GET /api/routes`, `POST /api/routes{prefix}` with `{target, ...data}`,
/// `DELETE /api/routes{prefix}`, all authorized by `Authorization: token ...`.
pub struct ProxyClient {
    client: reqwest::Client,
    api_url: String,
    auth_token: String,
}

impl ProxyClient {
    pub fn new(api_url: impl Into<String>, auth_token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
        })
    }

    fn routes_url(&self, prefix: &str) -> String {
        format!("{}/api/routes{}", self.api_url, prefix)
    }

    fn upstream(&self, action: &str, err: impl std::fmt::Display) -> HubError {
        warn!(api_url = %self.api_url, action, error = %err, "Proxy API request failed");
        HubError::Upstream(format!("Proxy failed to {}", action))
    }
}

#[async_trait]
impl RouteTable for ProxyClient {
    async fn get_routes(&self) -> HubResult<RouteMap> {
        let response = self
            .client
            .get(self.routes_url(""))
            .header("Authorization", format!("token {}", self.auth_token))
            .send()
            .await
            .map_err(|e| self.upstream("list routes", e))?;

        if !response.status().is_success() {
            return Err(self.upstream("list routes", response.status()));
        }

        response
            .json::<RouteMap>()
            .await
            .map_err(|e| self.upstream("list routes", e))
    }

    async fn add_route(&self, prefix: &str, target: &str, data: Map<String, Value>) -> HubResult<()> {
        let prefix = normalize_prefix(prefix);
        let body = Route {
            target: target.to_string(),
            data,
        };

        let response = self
            .client
            .post(self.routes_url(&prefix))
            .header("Authorization", format!("token {}", self.auth_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.upstream("add route", e))?;

        if !response.status().is_success() {
            return Err(self.upstream("add route", response.status()));
        }

        info!(prefix, target, "Added route to proxy");
        Ok(())
    }

    async fn delete_route(&self, prefix: &str) -> HubResult<()> {
        let prefix = normalize_prefix(prefix);
        let response = self
            .client
            .delete(self.routes_url(&prefix))
            .header("Authorization", format!("token {}", self.auth_token))
            .send()
            .await
            .map_err(|e| self.upstream("delete route", e))?;

        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(self.upstream("delete route", status));
        }

        info!(prefix, "Deleted route from proxy");
        Ok(())
    }
}
