//! SQLite storage layer -- connection pool and migrations.
//!
//! All inventory, metrics, task and execution tables live in one database.
//! Access goes through an r2d2 pool; its size is the outer bound on
//! concurrent database work.

pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path, max_connections: u32) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory: {}", parent.display())
            })?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::builder()
        .max_size(max_connections.max(1))
        .build(manager)
        .with_context(|| format!("failed to open database: {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Run synchronous database work off the async executor.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("database task panicked")?
}

/// Current time in the RFC 3339 form every table stores.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A pool over a fresh database file. Keep the `TempDir` alive for the
    /// duration of the test.
    pub fn temp_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(&dir.path().join("hostsync.db"), 8).unwrap();
        (dir, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_pool_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/data/hostsync.db");
        let pool = open_pool(&path, 2).unwrap();
        assert!(path.exists());
        assert_eq!(pool.max_size(), 2);
    }
}
