//! Spawnhub - A multi-user hub that spawns a server per user
//!
//! This library provides a hub control plane that:
//! - Authenticates users by password or a remote check and signs login cookies
//! - Spawns, polls and stops one single-user server per user
//! - Keeps a reverse proxy's routing table in sync with running servers
//! - Exposes a token-authenticated REST API for users, servers and tokens
//! - Registers and supervises external services
//! - Persists users, servers and hashed tokens in SQLite

pub mod api;
pub mod auth;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod db;
pub mod docker;
pub mod error;
pub mod hub;
pub mod pool;
pub mod proxy;
pub mod routes;
pub mod services;
pub mod spawner;
pub mod token;
pub mod user;
pub mod utils;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
