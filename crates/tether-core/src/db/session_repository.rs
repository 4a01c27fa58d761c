//! Session identity repository (local only, never synced)

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::SessionContext;

/// Trait for cached session storage
pub trait SessionRepository {
    fn get(&self) -> Result<Option<SessionContext>>;

    fn set(&self, session: &SessionContext) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// `SQLite` implementation of `SessionRepository`
pub struct SqliteSessionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSessionRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SessionRepository for SqliteSessionRepository<'_> {
    fn get(&self) -> Result<Option<SessionContext>> {
        let session = self
            .conn
            .query_row(
                "SELECT account_id, user_id, cached_at FROM session_context WHERE id = 1",
                [],
                |row| {
                    Ok(SessionContext {
                        account_id: row.get(0)?,
                        user_id: row.get(1)?,
                        cached_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    fn set(&self, session: &SessionContext) -> Result<()> {
        self.conn.execute(
            "INSERT INTO session_context (id, account_id, user_id, cached_at) VALUES (1, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                account_id = excluded.account_id,
                user_id = excluded.user_id,
                cached_at = excluded.cached_at",
            params![session.account_id, session.user_id, session.cached_at],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM session_context", [])?;
        Ok(())
    }
}
