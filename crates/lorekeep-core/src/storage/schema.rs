//! SQLite schema for the local store
//!
//! One database holds the entity collections, the pending-operation log, the
//! sync base snapshots and the materialized context artifacts, so that an
//! entity mutation and its queue entry commit in the same transaction.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version and write version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Entities of every collection, record body as JSON
        CREATE TABLE IF NOT EXISTS entities (
            collection TEXT NOT NULL,
            id INTEGER NOT NULL,
            body TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, id)
        );

        -- Unconfirmed (and recently confirmed) local mutations
        CREATE TABLE IF NOT EXISTS pending_ops (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            entity_id INTEGER NOT NULL,
            op TEXT NOT NULL,
            payload TEXT,
            enqueued_at INTEGER NOT NULL,
            confirmed INTEGER NOT NULL DEFAULT 0,
            confirmed_at INTEGER
        );

        -- Last confirmed common copy of each entity
        CREATE TABLE IF NOT EXISTS sync_base (
            collection TEXT NOT NULL,
            id INTEGER NOT NULL,
            body TEXT NOT NULL,
            synced_at INTEGER NOT NULL,
            PRIMARY KEY (collection, id)
        );

        -- Sync bookkeeping (last sync time etc.)
        CREATE TABLE IF NOT EXISTS sync_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Materialized context artifacts, one row per scope
        CREATE TABLE IF NOT EXISTS artifacts (
            scope TEXT PRIMARY KEY,
            artifact_id TEXT NOT NULL,
            generated_at INTEGER NOT NULL,
            source_counts TEXT NOT NULL,
            content BLOB NOT NULL,
            stale INTEGER NOT NULL DEFAULT 0,
            stale_since INTEGER,
            last_error TEXT
        );

        -- Groups that have been promoted to a dedicated artifact
        CREATE TABLE IF NOT EXISTS promoted_groups (
            group_id INTEGER PRIMARY KEY,
            promoted_at INTEGER NOT NULL
        );

        -- Regeneration audit log
        CREATE TABLE IF NOT EXISTS regeneration_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scope TEXT NOT NULL,
            trigger TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            item_count INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            error TEXT
        );

        -- Queue drains in enqueue order, per entity
        CREATE INDEX IF NOT EXISTS idx_pending_ops_entity
            ON pending_ops(collection, entity_id, confirmed);
        CREATE INDEX IF NOT EXISTS idx_pending_ops_confirmed
            ON pending_ops(confirmed, enqueued_at);

        CREATE INDEX IF NOT EXISTS idx_regeneration_log_scope
            ON regeneration_log(scope, started_at);
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_info (key, value) VALUES ('write_version', '0')",
        [],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    read_info(conn, "version").map(|v| v.and_then(|s| s.parse().ok()))
}

/// Get the write version, bumped by every committed local write
pub fn get_write_version(conn: &Connection) -> Result<i64> {
    read_info(conn, "write_version").map(|v| v.and_then(|s| s.parse().ok()).unwrap_or(0))
}

/// Store a new write version
pub fn set_write_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('write_version', ?)",
        [version.to_string()],
    )?;
    Ok(())
}

fn read_info(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = ?")?;
    match stmt.query_row([key], |row| row.get(0)) {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in [
            "entities",
            "pending_ops",
            "sync_base",
            "sync_meta",
            "artifacts",
            "promoted_groups",
            "regeneration_log",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_schema_version() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(needs_init(&conn));

        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        assert!(!needs_init(&conn));
    }

    #[test]
    fn test_write_version_survives_reinit() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_write_version(&conn).unwrap(), 0);

        set_write_version(&conn, 7).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_write_version(&conn).unwrap(), 7);
    }
}
