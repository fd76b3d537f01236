//! Memory database migrations
//!
//! SQL migrations are embedded as strings and executed when the database is opened.

use crate::Result;
use rusqlite::Connection;

/// Memory tables SQL (001)
pub const MEMORY_TABLES_SQL: &str = include_str!("001_memory_tables.sql");

/// Run all memory migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(MEMORY_TABLES_SQL)?;
    Ok(())
}
