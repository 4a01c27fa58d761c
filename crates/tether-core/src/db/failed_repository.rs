//! Dead-letter repository

use rusqlite::{params, Connection, OptionalExtension};

use super::{json_column, parsed_column};
use crate::error::Result;
use crate::models::{FailedOperation, OperationId};

/// Trait for failed operation storage
pub trait FailedOperationRepository {
    fn insert(&self, failed: &FailedOperation) -> Result<()>;

    fn get(&self, id: &OperationId) -> Result<Option<FailedOperation>>;

    /// Failures in original queue order
    fn list(&self) -> Result<Vec<FailedOperation>>;

    fn count(&self) -> Result<usize>;

    /// Drop an acknowledged failure
    fn remove(&self, id: &OperationId) -> Result<bool>;
}

/// `SQLite` implementation of `FailedOperationRepository`
pub struct SqliteFailedOperationRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteFailedOperationRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_failed(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailedOperation> {
        Ok(FailedOperation {
            operation: json_column(row, 0)?,
            reason: parsed_column(row, 1)?,
            message: row.get(2)?,
            failed_at: row.get(3)?,
        })
    }
}

impl FailedOperationRepository for SqliteFailedOperationRepository<'_> {
    fn insert(&self, failed: &FailedOperation) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO failed_operations (id, seq, operation, reason, message, failed_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                failed.operation.id.as_str(),
                failed.operation.seq,
                serde_json::to_string(&failed.operation)?,
                failed.reason.as_str(),
                failed.message,
                failed.failed_at,
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &OperationId) -> Result<Option<FailedOperation>> {
        let failed = self
            .conn
            .query_row(
                "SELECT operation, reason, message, failed_at FROM failed_operations WHERE id = ?",
                params![id.as_str()],
                Self::parse_failed,
            )
            .optional()?;
        Ok(failed)
    }

    fn list(&self) -> Result<Vec<FailedOperation>> {
        let mut stmt = self.conn.prepare(
            "SELECT operation, reason, message, failed_at FROM failed_operations ORDER BY seq ASC",
        )?;
        let failed = stmt
            .query_map([], Self::parse_failed)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(failed)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM failed_operations", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn remove(&self, id: &OperationId) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM failed_operations WHERE id = ?",
            params![id.as_str()],
        )?;
        Ok(rows > 0)
    }
}
