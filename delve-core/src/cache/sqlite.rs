//! Shared cache tier persisted in SQLite.
//!
//! Lets several processes (or successive runs of the CLI) reuse search
//! responses and assessments. Expiry uses wall-clock milliseconds since the
//! entries outlive the process that wrote them.

use super::{CacheHit, CacheTier};
use crate::error::CacheError;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const SWEEP_BATCH: i64 = 256;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL
)";

/// SQLite-backed shared tier.
pub struct SqliteTier {
    conn: Arc<Mutex<Connection>>,
    sweep_threshold: usize,
}

impl SqliteTier {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: &Path, sweep_threshold: usize) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::Backend {
                message: format!("Failed to create cache directory: {e}"),
            })?;
        }
        let conn = Connection::open(path).map_err(backend_err)?;
        Self::with_connection(conn, sweep_threshold)
    }

    /// A private in-memory database, mostly useful in tests.
    pub fn in_memory(sweep_threshold: usize) -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory().map_err(backend_err)?;
        Self::with_connection(conn, sweep_threshold)
    }

    fn with_connection(conn: Connection, sweep_threshold: usize) -> Result<Self, CacheError> {
        conn.execute(SCHEMA, []).map_err(backend_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sweep_threshold,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| CacheError::Backend {
                message: format!("sqlite tier lock poisoned: {e}"),
            })?;
            f(&conn)
        })
        .await
        .map_err(|e| CacheError::Backend {
            message: format!("sqlite task failed: {e}"),
        })?
    }
}

fn backend_err(e: rusqlite::Error) -> CacheError {
    CacheError::Backend {
        message: e.to_string(),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl CacheTier for SqliteTier {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheHit>, CacheError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let now = now_ms();
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT value, expires_at_ms FROM cache_entries WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(backend_err)?;
            match row {
                Some((value, expires_at)) if now < expires_at => Ok(Some(CacheHit {
                    value,
                    expires_in: Duration::from_millis((expires_at - now) as u64),
                })),
                Some(_) => {
                    conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
                        .map_err(backend_err)?;
                    Ok(None)
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let key = key.to_string();
        let sweep_threshold = self.sweep_threshold;
        self.blocking(move |conn| {
            let now = now_ms();
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries (key, value, created_at_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, value, now, now.saturating_add(ttl_ms)],
            )
            .map_err(backend_err)?;

            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
                .map_err(backend_err)?;
            if count as usize > sweep_threshold {
                let removed = conn
                    .execute(
                        "DELETE FROM cache_entries WHERE key IN (
                            SELECT key FROM cache_entries WHERE expires_at_ms <= ?1 LIMIT ?2
                        )",
                        params![now, SWEEP_BATCH],
                    )
                    .map_err(backend_err)?;
                if removed > 0 {
                    debug!(removed, "swept expired sqlite entries");
                }
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
                .map_err(backend_err)?;
            Ok(())
        })
        .await
    }

    async fn len(&self) -> Result<usize, CacheError> {
        self.blocking(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
                .map_err(backend_err)?;
            Ok(count as usize)
        })
        .await
    }
}
