//! Database module for the sync engine
//!
//! Provides the durable key-value store that persists the sync queue, stats,
//! device records, conflicts and cached entity state across restarts.
//! Values are JSON snapshots; each key is crash-safe on its own and
//! `set_batch` writes several keys in one transaction.

use rusqlite::params;
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
"#;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ============================================================================
// Durable Store
// ============================================================================

/// Durable key-value store consumed by the sync engine.
///
/// Implementations must make a single `set` crash-safe and a `set_batch`
/// all-or-nothing.
pub trait DurableStore: Send + Sync {
    /// Read the raw value stored under `key`
    fn get(&self, key: &str) -> DbResult<Option<String>>;

    /// Write `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> DbResult<()>;

    /// Write several keys atomically
    fn set_batch(&self, entries: &[(String, String)]) -> DbResult<()>;
}

/// Read and deserialize a JSON value from any store
pub fn load_json<T: DeserializeOwned>(store: &dyn DurableStore, key: &str) -> DbResult<Option<T>> {
    match store.get(key)? {
        Some(json) => serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| DbError::Serialization(format!("{}: {}", key, e))),
        None => Ok(None),
    }
}

/// Serialize a value to JSON for storage
pub fn to_json<T: Serialize>(value: &T) -> DbResult<String> {
    serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))
}

/// Serialize and write a JSON value to any store
pub fn save_json<T: Serialize>(store: &dyn DurableStore, key: &str, value: &T) -> DbResult<()> {
    store.set(key, &to_json(value)?)
}

// ============================================================================
// SQLite Database
// ============================================================================

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        log::info!("Database opened at {:?}", db_path);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every pooled connection to `:memory:` is its own database, so the pool
    /// is pinned to a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a pooled connection
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        load_json(self, key)
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        save_json(self, key, value)
    }
}

impl DurableStore for Database {
    fn get(&self, key: &str) -> DbResult<Option<String>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> DbResult<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, chrono::Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    fn set_batch(&self, entries: &[(String, String)]) -> DbResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();

        for (key, value) in entries {
            tx.execute(
                "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
