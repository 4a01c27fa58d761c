//! Conflict record repository

use rusqlite::{params, Connection, OptionalExtension};

use super::{json_column, parsed_column, parsed_column_opt};
use crate::error::Result;
use crate::models::{ConflictRecord, EntityId};

/// Trait for pending conflict storage, one record per entity
pub trait ConflictRepository {
    fn get(&self, item_id: &EntityId) -> Result<Option<ConflictRecord>>;

    /// Insert or merge into the entity's existing record
    fn upsert(&self, record: ConflictRecord) -> Result<ConflictRecord>;

    /// Records, oldest first, optionally limited to one scope
    fn list(&self, scope_id: Option<&str>) -> Result<Vec<ConflictRecord>>;

    fn count(&self) -> Result<usize>;

    fn remove(&self, item_id: &EntityId) -> Result<bool>;

    /// Rewrite every reference to `from` as `to`; returns the rows touched
    fn rebind(&self, from: &EntityId, to: &EntityId) -> Result<usize>;
}

/// `SQLite` implementation of `ConflictRepository`
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

const COLUMNS: &str =
    "item_id, kind, scope_id, parent_id, conflict_type, fields, local, server, operation_id, detected_at";

impl<'a> SqliteConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictRecord> {
        Ok(ConflictRecord {
            item_id: parsed_column(row, 0)?,
            kind: parsed_column(row, 1)?,
            scope_id: row.get(2)?,
            parent_id: parsed_column_opt(row, 3)?,
            conflict_type: parsed_column(row, 4)?,
            fields: json_column(row, 5)?,
            local: json_column(row, 6)?,
            server: json_column(row, 7)?,
            operation_id: parsed_column_opt(row, 8)?,
            detected_at: row.get(9)?,
        })
    }

    fn write(&self, record: &ConflictRecord) -> Result<()> {
        self.conn.execute(
            &format!("INSERT OR REPLACE INTO conflicts ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"),
            params![
                record.item_id.as_str(),
                record.kind.as_str(),
                record.scope_id,
                record.parent_id.as_ref().map(EntityId::as_str),
                record.conflict_type.as_str(),
                serde_json::to_string(&record.fields)?,
                serde_json::to_string(&record.local)?,
                serde_json::to_string(&record.server)?,
                record.operation_id.map(|id| id.as_str()),
                record.detected_at,
            ],
        )?;
        Ok(())
    }
}

impl ConflictRepository for SqliteConflictRepository<'_> {
    fn get(&self, item_id: &EntityId) -> Result<Option<ConflictRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM conflicts WHERE item_id = ?"),
                params![item_id.as_str()],
                Self::parse_record,
            )
            .optional()?;
        Ok(record)
    }

    fn upsert(&self, record: ConflictRecord) -> Result<ConflictRecord> {
        let merged = match self.get(&record.item_id)? {
            Some(mut existing) => {
                existing.merge(record);
                existing
            }
            None => record,
        };
        self.write(&merged)?;
        Ok(merged)
    }

    fn list(&self, scope_id: Option<&str>) -> Result<Vec<ConflictRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM conflicts
             WHERE ?1 IS NULL OR scope_id = ?1
             ORDER BY detected_at ASC, item_id ASC"
        ))?;
        let records = stmt
            .query_map(params![scope_id], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM conflicts", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn remove(&self, item_id: &EntityId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM conflicts WHERE item_id = ?", params![item_id.as_str()])?;
        Ok(rows > 0)
    }

    fn rebind(&self, from: &EntityId, to: &EntityId) -> Result<usize> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM conflicts
             WHERE item_id = ?1 OR parent_id = ?1 OR instr(local, ?1) > 0 OR instr(server, ?1) > 0"
        ))?;
        let candidates = stmt
            .query_map(params![from.as_str()], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut touched = 0;
        for mut record in candidates {
            let previous = record.item_id.clone();
            if record.rebind(from, to) {
                self.remove(&previous)?;
                self.upsert(record)?;
                touched += 1;
            }
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ConflictSide, ConflictType, EntityKind, Fields};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(item_id: EntityId, fields: &[&str], detected_at: i64) -> ConflictRecord {
        ConflictRecord {
            item_id,
            kind: EntityKind::new("items").unwrap(),
            conflict_type: ConflictType::UpdateUpdate,
            fields: fields.iter().map(ToString::to_string).collect(),
            local: ConflictSide {
                data: json!({"name": "local"}).as_object().cloned().unwrap(),
                timestamp: 1,
                version: 1,
            },
            server: ConflictSide {
                data: Fields::new(),
                timestamp: 2,
                version: 2,
            },
            parent_id: None,
            operation_id: None,
            scope_id: "acct".into(),
            detected_at,
        }
    }

    #[test]
    fn test_upsert_keeps_one_record_per_entity() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteConflictRepository::new(db.connection());
        let id = EntityId::new("5").unwrap();

        repo.upsert(record(id.clone(), &["name"], 1)).unwrap();
        let merged = repo.upsert(record(id.clone(), &["price"], 2)).unwrap();

        assert_eq!(repo.count().unwrap(), 1);
        assert_eq!(merged.fields, vec!["name".to_string(), "price".to_string()]);
        assert_eq!(repo.get(&id).unwrap(), Some(merged));
    }

    #[test]
    fn test_list_filters_by_scope() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteConflictRepository::new(db.connection());
        let mut other = record(EntityId::new("2").unwrap(), &["name"], 1);
        other.scope_id = "other".into();
        repo.upsert(record(EntityId::new("1").unwrap(), &["name"], 2)).unwrap();
        repo.upsert(other).unwrap();

        assert_eq!(repo.list(Some("acct")).unwrap().len(), 1);
        assert_eq!(repo.list(None).unwrap().len(), 2);
    }

    #[test]
    fn test_rebind_moves_record_key() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteConflictRepository::new(db.connection());
        let local = EntityId::optimistic();
        let real = EntityId::new("real").unwrap();
        repo.upsert(record(local.clone(), &["name"], 1)).unwrap();

        assert_eq!(repo.rebind(&local, &real).unwrap(), 1);
        assert!(repo.get(&local).unwrap().is_none());
        assert!(repo.get(&real).unwrap().is_some());
    }
}
