//! Operation queue repository

use rusqlite::{params, Connection, OptionalExtension};

use super::{json_column, json_column_opt, parsed_column, parsed_column_opt};
use crate::error::{RecordedError, Result};
use crate::models::{EntityId, Operation, OperationId};

/// Trait for durable queue storage
///
/// Operations are always returned in queue order (`seq` ascending).
pub trait OperationRepository {
    /// Append an operation, assigning its `seq`
    fn insert(&self, operation: &mut Operation) -> Result<()>;

    fn get(&self, id: &OperationId) -> Result<Option<Operation>>;

    /// Oldest pending operation
    fn head(&self) -> Result<Option<Operation>>;

    fn list(&self) -> Result<Vec<Operation>>;

    /// Pending operations targeting `entity_id`
    fn list_for_entity(&self, entity_id: &EntityId) -> Result<Vec<Operation>>;

    /// Pending operations attributed to `account_id`
    fn list_for_account(&self, account_id: &str) -> Result<Vec<Operation>>;

    fn count(&self) -> Result<usize>;

    /// Earliest scheduled retry among pending operations
    fn next_retry_at(&self) -> Result<Option<i64>>;

    /// Persist retry bookkeeping after a failed attempt
    fn record_attempt(
        &self,
        id: &OperationId,
        retry_count: u32,
        error: &RecordedError,
        next_attempt_at: Option<i64>,
    ) -> Result<()>;

    /// Move the baseline of one operation to a newer server version
    fn rebase(&self, id: &OperationId, version: i64, timestamp: i64) -> Result<()>;

    /// Move the baseline of every pending operation on `entity_id`
    fn advance_baseline(&self, entity_id: &EntityId, version: i64, timestamp: i64) -> Result<usize>;

    fn remove(&self, id: &OperationId) -> Result<bool>;

    fn remove_for_entity(&self, entity_id: &EntityId) -> Result<usize>;

    /// Rewrite every reference to `from` as `to`; returns the rows touched
    fn rebind(&self, from: &EntityId, to: &EntityId) -> Result<usize>;
}

/// `SQLite` implementation of `OperationRepository`
pub struct SqliteOperationRepository<'a> {
    conn: &'a Connection,
}

const COLUMNS: &str = "id, seq, op_type, kind, entity_id, parent_id, payload, baseline, account_id, user_id, \
                       base_version, base_timestamp, enqueued_at, retry_count, last_error, next_attempt_at";

impl<'a> SqliteOperationRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an operation from a database row
    fn parse_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Operation> {
        Ok(Operation {
            id: parsed_column(row, 0)?,
            seq: row.get(1)?,
            op_type: parsed_column(row, 2)?,
            kind: parsed_column(row, 3)?,
            entity_id: parsed_column(row, 4)?,
            parent_id: parsed_column_opt(row, 5)?,
            payload: json_column(row, 6)?,
            baseline: json_column(row, 7)?,
            account_id: row.get(8)?,
            user_id: row.get(9)?,
            base_version: row.get(10)?,
            base_timestamp: row.get(11)?,
            enqueued_at: row.get(12)?,
            retry_count: row.get(13)?,
            last_error: json_column_opt(row, 14)?,
            next_attempt_at: row.get(15)?,
        })
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Operation>> {
        let mut stmt = self.conn.prepare(sql)?;
        let operations = stmt
            .query_map(params, Self::parse_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    fn write_rebound(&self, operation: &Operation) -> Result<()> {
        self.conn.execute(
            "UPDATE operations SET entity_id = ?, parent_id = ?, payload = ?, baseline = ? WHERE id = ?",
            params![
                operation.entity_id.as_str(),
                operation.parent_id.as_ref().map(EntityId::as_str),
                serde_json::to_string(&operation.payload)?,
                serde_json::to_string(&operation.baseline)?,
                operation.id.as_str(),
            ],
        )?;
        Ok(())
    }
}

impl OperationRepository for SqliteOperationRepository<'_> {
    fn insert(&self, operation: &mut Operation) -> Result<()> {
        let seq: i64 = self.conn.query_row(
            "UPDATE queue_counter SET last_seq = last_seq + 1 WHERE id = 1 RETURNING last_seq",
            [],
            |row| row.get(0),
        )?;
        operation.seq = seq;

        self.conn.execute(
            &format!("INSERT INTO operations ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"),
            params![
                operation.id.as_str(),
                operation.seq,
                operation.op_type.as_str(),
                operation.kind.as_str(),
                operation.entity_id.as_str(),
                operation.parent_id.as_ref().map(EntityId::as_str),
                serde_json::to_string(&operation.payload)?,
                serde_json::to_string(&operation.baseline)?,
                operation.account_id,
                operation.user_id,
                operation.base_version,
                operation.base_timestamp,
                operation.enqueued_at,
                operation.retry_count,
                operation
                    .last_error
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                operation.next_attempt_at,
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &OperationId) -> Result<Option<Operation>> {
        let operation = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM operations WHERE id = ?"),
                params![id.as_str()],
                Self::parse_operation,
            )
            .optional()?;
        Ok(operation)
    }

    fn head(&self) -> Result<Option<Operation>> {
        let operation = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM operations ORDER BY seq ASC LIMIT 1"),
                [],
                Self::parse_operation,
            )
            .optional()?;
        Ok(operation)
    }

    fn list(&self) -> Result<Vec<Operation>> {
        self.query(&format!("SELECT {COLUMNS} FROM operations ORDER BY seq ASC"), [])
    }

    fn list_for_entity(&self, entity_id: &EntityId) -> Result<Vec<Operation>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM operations WHERE entity_id = ? ORDER BY seq ASC"),
            params![entity_id.as_str()],
        )
    }

    fn list_for_account(&self, account_id: &str) -> Result<Vec<Operation>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM operations WHERE account_id = ? ORDER BY seq ASC"),
            params![account_id],
        )
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM operations", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn next_retry_at(&self) -> Result<Option<i64>> {
        let at: Option<i64> = self.conn.query_row(
            "SELECT MIN(next_attempt_at) FROM operations WHERE next_attempt_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(at)
    }

    fn record_attempt(
        &self,
        id: &OperationId,
        retry_count: u32,
        error: &RecordedError,
        next_attempt_at: Option<i64>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE operations SET retry_count = ?, last_error = ?, next_attempt_at = ? WHERE id = ?",
            params![
                retry_count,
                serde_json::to_string(error)?,
                next_attempt_at,
                id.as_str()
            ],
        )?;
        Ok(())
    }

    fn rebase(&self, id: &OperationId, version: i64, timestamp: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE operations SET base_version = ?, base_timestamp = ? WHERE id = ?",
            params![version, timestamp, id.as_str()],
        )?;
        Ok(())
    }

    fn advance_baseline(&self, entity_id: &EntityId, version: i64, timestamp: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE operations SET base_version = ?, base_timestamp = ?
             WHERE entity_id = ? AND op_type != 'create'",
            params![version, timestamp, entity_id.as_str()],
        )?;
        Ok(rows)
    }

    fn remove(&self, id: &OperationId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM operations WHERE id = ?", params![id.as_str()])?;
        Ok(rows > 0)
    }

    fn remove_for_entity(&self, entity_id: &EntityId) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM operations WHERE entity_id = ?",
            params![entity_id.as_str()],
        )?;
        Ok(rows)
    }

    fn rebind(&self, from: &EntityId, to: &EntityId) -> Result<usize> {
        let candidates = self.query(
            &format!(
                "SELECT {COLUMNS} FROM operations
                 WHERE entity_id = ?1 OR parent_id = ?1 OR instr(payload, ?1) > 0 OR instr(baseline, ?1) > 0
                 ORDER BY seq ASC"
            ),
            params![from.as_str()],
        )?;

        let mut touched = 0;
        for mut operation in candidates {
            if operation.rebind(from, to) {
                self.write_rebound(&operation)?;
                touched += 1;
            }
        }
        Ok(touched)
    }
}
