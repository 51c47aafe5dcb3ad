//! Schema migrations
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once inside its own transaction, tracked by the
//! `schema_version` table.

use rusqlite::Connection;

use crate::error::{Result, WorkflowError};

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

fn ensure_schema_version_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );",
    )?;
    Ok(())
}

/// Highest applied migration version, or 0 if none
pub fn current_version(conn: &Connection) -> Result<i32> {
    ensure_schema_version_table(conn)?;
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Run all pending migrations. Returns the number applied (0 if up-to-date).
///
/// A database newer than the newest known migration is refused rather than
/// silently run against an unknown schema.
pub fn run_migrations(conn: &mut Connection) -> Result<usize> {
    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    if current > max_known {
        return Err(WorkflowError::store_unavailable(format!(
            "database schema v{} is newer than this server (v{})",
            current, max_known
        )));
    }

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )?;
        tx.commit()?;
        tracing::info!("Applied schema migration v{}", migration.version);
        applied += 1;
    }

    Ok(applied)
}
