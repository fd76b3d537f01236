//! Database Connection
//!
//! Opens the SQLite database shared by every memory component. rusqlite
//! connections are not `Sync`, so the single connection lives behind an
//! async mutex and every component clones the [`Db`] handle.

pub mod migrations;

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::Result;

/// Shared database handle
pub type Db = Arc<Mutex<Connection>>;

/// Open (or create) the database at `path` and apply migrations
pub fn open(path: impl AsRef<Path>) -> Result<Db> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    configure(&conn)?;
    tracing::debug!(path = %path.display(), "Opened memory database");
    Ok(Arc::new(Mutex::new(conn)))
}

/// Open a private in-memory database with migrations applied
pub fn open_in_memory() -> Result<Db> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn configure(conn: &Connection) -> Result<()> {
    // WAL mode for concurrent readers alongside the background workers
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
    )?;
    migrations::run_migrations(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_tables() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path().join("nested").join("memory.db")).unwrap();
        let conn = db.lock().await;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'memory_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = open_in_memory().unwrap();
        let conn = db.lock().await;
        migrations::run_migrations(&conn).unwrap();
        migrations::run_migrations(&conn).unwrap();
    }
}
