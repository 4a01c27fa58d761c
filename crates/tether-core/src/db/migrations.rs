//! Database migrations
//!
//! Forward-only. Each step runs in its own transaction and records its version
//! in `schema_version`. No step rewrites queued operations.

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = current_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn current_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Migration to version 1: cache, queue and conflicts
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS cached_entities (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            parent_id TEXT,
            fields TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            updated_by TEXT,
            updated_at INTEGER NOT NULL,
            last_synced_at INTEGER,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            is_optimistic INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_cached_entities_scope ON cached_entities(scope_id, kind);
        CREATE INDEX IF NOT EXISTS idx_cached_entities_parent ON cached_entities(parent_id);

        CREATE TABLE IF NOT EXISTS queue_counter (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_seq INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO queue_counter (id, last_seq) VALUES (1, 0);

        CREATE TABLE IF NOT EXISTS operations (
            id TEXT PRIMARY KEY,
            seq INTEGER NOT NULL UNIQUE,
            op_type TEXT NOT NULL,
            kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            parent_id TEXT,
            payload TEXT NOT NULL,
            baseline TEXT NOT NULL,
            account_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            base_version INTEGER,
            base_timestamp INTEGER,
            enqueued_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            next_attempt_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_operations_account_seq ON operations(account_id, seq);
        CREATE INDEX IF NOT EXISTS idx_operations_entity ON operations(entity_id);

        CREATE TABLE IF NOT EXISTS conflicts (
            item_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            parent_id TEXT,
            conflict_type TEXT NOT NULL,
            fields TEXT NOT NULL,
            local TEXT NOT NULL,
            server TEXT NOT NULL,
            operation_id TEXT,
            detected_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conflicts_scope ON conflicts(scope_id);

        INSERT INTO schema_version (version) VALUES (1);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: dead letters and cached session identity
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS failed_operations (
            id TEXT PRIMARY KEY,
            seq INTEGER NOT NULL,
            operation TEXT NOT NULL,
            reason TEXT NOT NULL,
            message TEXT NOT NULL,
            failed_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_failed_operations_failed_at ON failed_operations(failed_at);

        CREATE TABLE IF NOT EXISTS session_context (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            account_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            cached_at INTEGER NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);",
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version 2");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_v2_upgrades_existing_v1_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate_v1(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO operations (id, seq, op_type, kind, entity_id, payload, baseline, account_id, user_id, enqueued_at)
             VALUES ('op', 1, 'create', 'items', 'local-1', '{}', '{}', 'a', 'u', 1)",
            [],
        )
        .unwrap();

        run(&mut conn).unwrap();

        let pending: i64 = conn
            .query_row("SELECT COUNT(*) FROM operations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(pending, 1);
        assert_eq!(current_version(&conn).unwrap(), 2);
    }
}
