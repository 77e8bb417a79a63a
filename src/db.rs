//! SQLite record store for users, API tokens and running servers
//!
//! This is the hub's durable state: which users exist, their hashed tokens,
//! and enough about each running server (address, cookie secret, spawner
//! state) to re-attach to it after a hub restart.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// A persisted hub user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub name: String,
    pub admin: bool,
    /// Random id embedded in signed cookies; rotated on logout
    pub cookie_id: String,
    /// RFC 3339 timestamp
    pub last_activity: String,
    pub created_at: String,
}

/// A persisted per-user server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerRecord {
    pub user_name: String,
    pub base_url: String,
    pub ip: String,
    pub port: u16,
    pub cookie_name: String,
    pub cookie_secret: String,
    /// Spawner state as JSON, e.g. `{"pid": 4242}`
    pub state: String,
    pub started_at: String,
}

/// A persisted API token hash
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenRecord {
    pub id: i64,
    pub user_name: String,
    pub prefix: String,
    pub hashed: String,
    /// "api" for user-requested tokens, "server" for tokens handed to a spawned server
    pub note: String,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .context("Failed to open database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: Initial schema
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS users (
                name TEXT PRIMARY KEY,
                admin INTEGER NOT NULL DEFAULT 0,
                cookie_id TEXT NOT NULL,
                last_activity TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS api_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_name TEXT NOT NULL REFERENCES users(name) ON DELETE CASCADE ON UPDATE CASCADE,
                prefix TEXT NOT NULL,
                hashed TEXT NOT NULL,
                note TEXT NOT NULL DEFAULT 'api',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                last_used_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_api_tokens_prefix ON api_tokens(prefix);

            CREATE TABLE IF NOT EXISTS servers (
                user_name TEXT PRIMARY KEY REFERENCES users(name) ON DELETE CASCADE ON UPDATE CASCADE,
                base_url TEXT NOT NULL,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                cookie_name TEXT NOT NULL,
                cookie_secret TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT '{}',
                started_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    // ==================== Users ====================

    pub fn create_user(&self, user: &UserRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (name, admin, cookie_id, last_activity) VALUES (?1, ?2, ?3, ?4)",
            params![user.name, user.admin, user.cookie_id, user.last_activity],
        )
        .with_context(|| format!("Failed to create user {}", user.name))?;
        Ok(())
    }

    pub fn get_user(&self, name: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, admin, cookie_id, last_activity, created_at FROM users WHERE name = ?1",
            params![name],
            |row| {
                Ok(UserRecord {
                    name: row.get(0)?,
                    admin: row.get(1)?,
                    cookie_id: row.get(2)?,
                    last_activity: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()
        .context("Failed to get user")
    }

    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, admin, cookie_id, last_activity, created_at FROM users ORDER BY name",
        )?;

        let users = stmt
            .query_map([], |row| {
                Ok(UserRecord {
                    name: row.get(0)?,
                    admin: row.get(1)?,
                    cookie_id: row.get(2)?,
                    last_activity: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(users)
    }

    pub fn set_admin(&self, name: &str, admin: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET admin = ?1 WHERE name = ?2",
            params![admin, name],
        )?;
        Ok(())
    }

    /// Rename a user; tokens and server records follow via ON UPDATE CASCADE
    pub fn rename_user(&self, old: &str, new: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET name = ?1 WHERE name = ?2",
            params![new, old],
        )
        .with_context(|| format!("Failed to rename user {} to {}", old, new))?;
        Ok(())
    }

    pub fn set_cookie_id(&self, name: &str, cookie_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET cookie_id = ?1 WHERE name = ?2",
            params![cookie_id, name],
        )?;
        Ok(())
    }

    pub fn set_last_activity(&self, name: &str, timestamp: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET last_activity = ?1 WHERE name = ?2",
            params![timestamp, name],
        )?;
        Ok(())
    }

    /// Delete a user with its tokens and server record
    pub fn delete_user(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM users WHERE name = ?1", params![name])?;
        Ok(rows > 0)
    }

    // ==================== Tokens ====================

    pub fn insert_token(&self, user_name: &str, prefix: &str, hashed: &str, note: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO api_tokens (user_name, prefix, hashed, note) VALUES (?1, ?2, ?3, ?4)",
            params![user_name, prefix, hashed, note],
        )
        .with_context(|| format!("Failed to store token for {}", user_name))?;
        Ok(conn.last_insert_rowid())
    }

    /// Tokens whose clear-text prefix matches; the caller checks the hash
    pub fn find_tokens_by_prefix(&self, prefix: &str) -> Result<Vec<TokenRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_name, prefix, hashed, note, created_at, last_used_at
             FROM api_tokens WHERE prefix = ?1",
        )?;

        let tokens = stmt
            .query_map(params![prefix], |row| {
                Ok(TokenRecord {
                    id: row.get(0)?,
                    user_name: row.get(1)?,
                    prefix: row.get(2)?,
                    hashed: row.get(3)?,
                    note: row.get(4)?,
                    created_at: row.get(5)?,
                    last_used_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(tokens)
    }

    pub fn touch_token(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE api_tokens SET last_used_at = datetime('now') WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Revoke every token of `user_name` carrying `note`
    pub fn delete_tokens(&self, user_name: &str, note: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM api_tokens WHERE user_name = ?1 AND note = ?2",
            params![user_name, note],
        )?;
        Ok(rows)
    }

    pub fn count_tokens(&self, user_name: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM api_tokens WHERE user_name = ?1",
            params![user_name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ==================== Servers ====================

    pub fn upsert_server(&self, server: &ServerRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO servers (user_name, base_url, ip, port, cookie_name, cookie_secret, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_name) DO UPDATE SET
                base_url = excluded.base_url,
                ip = excluded.ip,
                port = excluded.port,
                cookie_name = excluded.cookie_name,
                cookie_secret = excluded.cookie_secret,
                state = excluded.state",
            params![
                server.user_name,
                server.base_url,
                server.ip,
                server.port,
                server.cookie_name,
                server.cookie_secret,
                server.state
            ],
        )
        .with_context(|| format!("Failed to store server for {}", server.user_name))?;
        Ok(())
    }

    pub fn get_server(&self, user_name: &str) -> Result<Option<ServerRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_name, base_url, ip, port, cookie_name, cookie_secret, state, started_at
             FROM servers WHERE user_name = ?1",
            params![user_name],
            |row| {
                Ok(ServerRecord {
                    user_name: row.get(0)?,
                    base_url: row.get(1)?,
                    ip: row.get(2)?,
                    port: row.get(3)?,
                    cookie_name: row.get(4)?,
                    cookie_secret: row.get(5)?,
                    state: row.get(6)?,
                    started_at: row.get(7)?,
                })
            },
        )
        .optional()
        .context("Failed to get server")
    }

    pub fn list_servers(&self) -> Result<Vec<ServerRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_name, base_url, ip, port, cookie_name, cookie_secret, state, started_at
             FROM servers ORDER BY user_name",
        )?;

        let servers = stmt
            .query_map([], |row| {
                Ok(ServerRecord {
                    user_name: row.get(0)?,
                    base_url: row.get(1)?,
                    ip: row.get(2)?,
                    port: row.get(3)?,
                    cookie_name: row.get(4)?,
                    cookie_secret: row.get(5)?,
                    state: row.get(6)?,
                    started_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(servers)
    }

    pub fn delete_server(&self, user_name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM servers WHERE user_name = ?1", params![user_name])?;
        Ok(rows > 0)
    }
}
