//! Cached entity repository

use rusqlite::{params, Connection, OptionalExtension};

use super::{json_column, parsed_column, parsed_column_opt};
use crate::error::Result;
use crate::models::{rebind_fields, CachedEntity, EntityId, EntityKind};

/// Trait for local cache storage
pub trait EntityRepository {
    /// Get a cached entity by ID, including tombstoned ones
    fn get(&self, id: &EntityId) -> Result<Option<CachedEntity>>;

    /// Insert or replace a cached entity
    fn upsert(&self, entity: &CachedEntity) -> Result<()>;

    /// Remove an entity from the cache
    fn remove(&self, id: &EntityId) -> Result<bool>;

    /// Live entities in a scope, optionally of one kind
    fn list_by_scope(&self, scope_id: &str, kind: Option<&EntityKind>) -> Result<Vec<CachedEntity>>;

    /// Live entities owned by `parent_id`
    fn list_children(&self, parent_id: &EntityId) -> Result<Vec<CachedEntity>>;

    /// Entities in a scope confirmed by the server at or after `since` (Unix ms)
    fn recently_synced(&self, scope_id: &str, since: i64) -> Result<Vec<CachedEntity>>;

    /// Rewrite every reference to `from` as `to`; returns the rows touched
    fn rebind(&self, from: &EntityId, to: &EntityId) -> Result<usize>;
}

/// `SQLite` implementation of `EntityRepository`
pub struct SqliteEntityRepository<'a> {
    conn: &'a Connection,
}

const COLUMNS: &str = "id, kind, scope_id, parent_id, fields, version, updated_by, updated_at, last_synced_at, is_deleted";

impl<'a> SqliteEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an entity from a database row
    fn parse_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedEntity> {
        Ok(CachedEntity {
            id: parsed_column(row, 0)?,
            kind: parsed_column(row, 1)?,
            scope_id: row.get(2)?,
            parent_id: parsed_column_opt(row, 3)?,
            fields: json_column(row, 4)?,
            version: row.get(5)?,
            updated_by: row.get(6)?,
            updated_at: row.get(7)?,
            last_synced_at: row.get(8)?,
            is_deleted: row.get::<_, i32>(9)? != 0,
        })
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<CachedEntity>> {
        let mut stmt = self.conn.prepare(sql)?;
        let entities = stmt
            .query_map(params, Self::parse_entity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entities)
    }
}

impl EntityRepository for SqliteEntityRepository<'_> {
    fn get(&self, id: &EntityId) -> Result<Option<CachedEntity>> {
        let entity = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM cached_entities WHERE id = ?"),
                params![id.as_str()],
                Self::parse_entity,
            )
            .optional()?;
        Ok(entity)
    }

    fn upsert(&self, entity: &CachedEntity) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cached_entities
                (id, kind, scope_id, parent_id, fields, version, updated_by, updated_at, last_synced_at, is_deleted, is_optimistic)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                scope_id = excluded.scope_id,
                parent_id = excluded.parent_id,
                fields = excluded.fields,
                version = excluded.version,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at,
                last_synced_at = excluded.last_synced_at,
                is_deleted = excluded.is_deleted,
                is_optimistic = excluded.is_optimistic",
            params![
                entity.id.as_str(),
                entity.kind.as_str(),
                entity.scope_id,
                entity.parent_id.as_ref().map(EntityId::as_str),
                serde_json::to_string(&entity.fields)?,
                entity.version,
                entity.updated_by,
                entity.updated_at,
                entity.last_synced_at,
                i32::from(entity.is_deleted),
                i32::from(entity.is_optimistic()),
            ],
        )?;
        Ok(())
    }

    fn remove(&self, id: &EntityId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM cached_entities WHERE id = ?", params![id.as_str()])?;
        Ok(rows > 0)
    }

    fn list_by_scope(&self, scope_id: &str, kind: Option<&EntityKind>) -> Result<Vec<CachedEntity>> {
        match kind {
            Some(kind) => self.query(
                &format!(
                    "SELECT {COLUMNS} FROM cached_entities
                     WHERE scope_id = ? AND kind = ? AND is_deleted = 0
                     ORDER BY updated_at DESC"
                ),
                params![scope_id, kind.as_str()],
            ),
            None => self.query(
                &format!(
                    "SELECT {COLUMNS} FROM cached_entities
                     WHERE scope_id = ? AND is_deleted = 0
                     ORDER BY updated_at DESC"
                ),
                params![scope_id],
            ),
        }
    }

    fn list_children(&self, parent_id: &EntityId) -> Result<Vec<CachedEntity>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM cached_entities
                 WHERE parent_id = ? AND is_deleted = 0
                 ORDER BY updated_at DESC"
            ),
            params![parent_id.as_str()],
        )
    }

    fn recently_synced(&self, scope_id: &str, since: i64) -> Result<Vec<CachedEntity>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM cached_entities
                 WHERE scope_id = ? AND is_optimistic = 0 AND last_synced_at >= ?
                 ORDER BY last_synced_at DESC"
            ),
            params![scope_id, since],
        )
    }

    fn rebind(&self, from: &EntityId, to: &EntityId) -> Result<usize> {
        let mut touched = 0;

        if self.get(from)?.is_some() {
            if self.get(to)?.is_some() {
                self.remove(from)?;
            } else {
                self.conn.execute(
                    "UPDATE cached_entities SET id = ?, is_optimistic = 0 WHERE id = ?",
                    params![to.as_str(), from.as_str()],
                )?;
            }
            touched += 1;
        }

        touched += self.conn.execute(
            "UPDATE cached_entities SET parent_id = ? WHERE parent_id = ?",
            params![to.as_str(), from.as_str()],
        )?;

        let referencing = self.query(
            &format!("SELECT {COLUMNS} FROM cached_entities WHERE instr(fields, ?) > 0"),
            params![from.as_str()],
        )?;
        for mut entity in referencing {
            if rebind_fields(&mut entity.fields, from, to) {
                self.conn.execute(
                    "UPDATE cached_entities SET fields = ? WHERE id = ?",
                    params![serde_json::to_string(&entity.fields)?, entity.id.as_str()],
                )?;
                touched += 1;
            }
        }

        Ok(touched)
    }
}
