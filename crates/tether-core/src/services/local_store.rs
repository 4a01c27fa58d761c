//! Durable local store shared by every engine component.
//!
//! Each public method that changes more than one table runs as a single
//! immediate transaction, so a crash leaves either the old state or the new
//! one. In particular, removing a completed operation, writing the server copy
//! into the cache and rebinding an optimistic id commit together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{Connection, Transaction};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::db::{
    ConflictRepository, Database, EntityRepository, FailedOperationRepository, OperationRepository,
    SessionRepository, SqliteConflictRepository, SqliteEntityRepository,
    SqliteFailedOperationRepository, SqliteOperationRepository, SqliteSessionRepository,
};
use crate::error::{RecordedError, Result};
use crate::models::{
    CachedEntity, ConflictRecord, EntityId, EntityKind, FailedOperation, FailureReason, Fields,
    Operation, OperationId, OperationType, SessionContext,
};
use crate::remote::RemoteRecord;

/// Server confirmation of a queued operation
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Create or update acknowledged; fields already in local names
    Stored(RemoteRecord),
    /// Delete acknowledged, or the row was already gone
    Deleted,
}

/// Cache outcome of a conflict resolution
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedState {
    /// Authoritative row after resolution; may carry a new id after a re-create
    Stored(RemoteRecord),
    /// The entity no longer exists
    Removed,
}

/// Thread-safe handle to the `SQLite` store.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open a store at the given filesystem path, creating parent directories.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::open(&db_path)?;
        tracing::info!(path = %db_path.display(), "Opened local store");
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open_in_memory()?)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Run `f` against the connection
    pub async fn read<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let db = self.db.lock().await;
        f(db.connection())
    }

    /// Run `f` in one immediate transaction; any error rolls everything back
    pub async fn mutate<R>(&self, op: &str, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        debug!(op, "Committed store transaction");
        Ok(result)
    }

    /// Cap the database size; used to exercise quota handling
    pub async fn set_max_page_count(&self, pages: u32) -> Result<()> {
        self.db.lock().await.set_max_page_count(pages)
    }

    // -- cache ---------------------------------------------------------------

    pub async fn cached(&self, id: &EntityId) -> Result<Option<CachedEntity>> {
        self.read(|conn| SqliteEntityRepository::new(conn).get(id)).await
    }

    pub async fn list_cached(&self, scope_id: &str, kind: Option<&EntityKind>) -> Result<Vec<CachedEntity>> {
        self.read(|conn| SqliteEntityRepository::new(conn).list_by_scope(scope_id, kind))
            .await
    }

    pub async fn list_children(&self, parent_id: &EntityId) -> Result<Vec<CachedEntity>> {
        self.read(|conn| SqliteEntityRepository::new(conn).list_children(parent_id))
            .await
    }

    pub async fn recently_synced(&self, scope_id: &str, since: i64) -> Result<Vec<CachedEntity>> {
        self.read(|conn| SqliteEntityRepository::new(conn).recently_synced(scope_id, since))
            .await
    }

    /// Read-through: store a server copy unless local changes are pending on it.
    ///
    /// Returns the cached entity as it stands afterwards.
    pub async fn cache_remote(&self, kind: &EntityKind, record: RemoteRecord, now: i64) -> Result<CachedEntity> {
        self.mutate("cache_remote", |tx| {
            let entities = SqliteEntityRepository::new(tx);
            let operations = SqliteOperationRepository::new(tx);
            if operations.list_for_entity(&record.id)?.is_empty() {
                let fresh = record.into_cached(kind, now);
                entities.upsert(&fresh)?;
                Ok(fresh)
            } else {
                let id = record.id.clone();
                entities
                    .get(&id)?
                    .map_or_else(|| Ok(record.into_cached(kind, now)), Ok)
            }
        })
        .await
    }

    /// Replace the cached copy of an entity without pending operations when the server is newer
    pub async fn refresh_if_newer(&self, kind: &EntityKind, record: RemoteRecord, now: i64) -> Result<bool> {
        self.mutate("refresh_if_newer", |tx| {
            let entities = SqliteEntityRepository::new(tx);
            let operations = SqliteOperationRepository::new(tx);
            if !operations.list_for_entity(&record.id)?.is_empty() {
                return Ok(false);
            }
            let newer = entities
                .get(&record.id)?
                .map_or(true, |cached| record.version > cached.version);
            if newer {
                entities.upsert(&record.into_cached(kind, now))?;
            }
            Ok(newer)
        })
        .await
    }

    /// Drop a cached entity the server no longer has, unless local changes are pending
    pub async fn evict_if_clean(&self, id: &EntityId) -> Result<bool> {
        self.mutate("evict_if_clean", |tx| {
            if SqliteOperationRepository::new(tx).list_for_entity(id)?.is_empty() {
                SqliteEntityRepository::new(tx).remove(id)
            } else {
                Ok(false)
            }
        })
        .await
    }

    // -- queue ---------------------------------------------------------------

    pub async fn pending_operations(&self) -> Result<Vec<Operation>> {
        self.read(|conn| SqliteOperationRepository::new(conn).list()).await
    }

    pub async fn pending_for_account(&self, account_id: &str) -> Result<Vec<Operation>> {
        self.read(|conn| SqliteOperationRepository::new(conn).list_for_account(account_id))
            .await
    }

    pub async fn operation(&self, id: &OperationId) -> Result<Option<Operation>> {
        self.read(|conn| SqliteOperationRepository::new(conn).get(id)).await
    }

    pub async fn head(&self) -> Result<Option<Operation>> {
        self.read(|conn| SqliteOperationRepository::new(conn).head()).await
    }

    pub async fn queue_length(&self) -> Result<usize> {
        self.read(|conn| SqliteOperationRepository::new(conn).count()).await
    }

    /// `(pending, failed, next retry)` in one read
    pub async fn queue_counts(&self) -> Result<(usize, usize, Option<i64>)> {
        self.read(|conn| {
            let operations = SqliteOperationRepository::new(conn);
            Ok((
                operations.count()?,
                SqliteFailedOperationRepository::new(conn).count()?,
                operations.next_retry_at()?,
            ))
        })
        .await
    }

    /// Persist a new operation together with its optimistic cache change.
    ///
    /// The baseline, base version and base timestamp are captured from the
    /// cache inside the same transaction.
    pub async fn enqueue(&self, mut operation: Operation) -> Result<Operation> {
        self.mutate("enqueue", |tx| {
            let entities = SqliteEntityRepository::new(tx);
            let operations = SqliteOperationRepository::new(tx);
            let now = operation.enqueued_at;

            match operation.op_type {
                OperationType::Create => {
                    entities.upsert(&CachedEntity {
                        id: operation.entity_id.clone(),
                        kind: operation.kind.clone(),
                        scope_id: operation.account_id.clone(),
                        parent_id: operation.parent_id.clone(),
                        fields: operation.payload.clone(),
                        version: 0,
                        updated_by: Some(operation.user_id.clone()),
                        updated_at: now,
                        last_synced_at: None,
                        is_deleted: false,
                    })?;
                }
                OperationType::Update => {
                    if let Some(mut cached) = entities.get(&operation.entity_id)? {
                        operation.baseline = operation
                            .payload
                            .keys()
                            .map(|key| (key.clone(), cached.fields.get(key).cloned().unwrap_or(Value::Null)))
                            .collect();
                        capture_base(&mut operation, &cached);
                        if operation.parent_id.is_none() {
                            operation.parent_id.clone_from(&cached.parent_id);
                        }
                        cached.apply_patch(&operation.payload, now);
                        cached.updated_by = Some(operation.user_id.clone());
                        entities.upsert(&cached)?;
                    }
                }
                OperationType::Delete => {
                    if let Some(mut cached) = entities.get(&operation.entity_id)? {
                        operation.baseline = cached.fields.clone();
                        capture_base(&mut operation, &cached);
                        if operation.parent_id.is_none() {
                            operation.parent_id.clone_from(&cached.parent_id);
                        }
                        cached.is_deleted = true;
                        cached.updated_at = now;
                        entities.upsert(&cached)?;
                    }
                }
            }

            operations.insert(&mut operation)?;
            Ok(operation)
        })
        .await
    }

    /// Remove a confirmed operation and write the server's copy, rebinding ids
    pub async fn complete_operation(&self, operation: &Operation, completion: Completion, now: i64) -> Result<()> {
        self.mutate("complete_operation", |tx| {
            let entities = SqliteEntityRepository::new(tx);
            let operations = SqliteOperationRepository::new(tx);
            operations.remove(&operation.id)?;

            match completion {
                Completion::Stored(record) => {
                    let real_id = record.id.clone();
                    if real_id != operation.entity_id {
                        entities.remove(&operation.entity_id)?;
                        rebind_in(tx, &operation.entity_id, &real_id)?;
                    }
                    operations.advance_baseline(&real_id, record.version, record.updated_at)?;
                    entities.upsert(&record.into_cached(&operation.kind, now))?;
                    reapply_pending(tx, &real_id)?;
                }
                Completion::Deleted => {
                    entities.remove(&operation.entity_id)?;
                }
            }
            Ok(())
        })
        .await
    }

    /// Persist retry bookkeeping for a transient failure
    pub async fn record_retry(
        &self,
        id: &OperationId,
        retry_count: u32,
        error: &RecordedError,
        next_attempt_at: Option<i64>,
    ) -> Result<()> {
        self.mutate("record_retry", |tx| {
            SqliteOperationRepository::new(tx).record_attempt(id, retry_count, error, next_attempt_at)
        })
        .await
    }

    pub async fn rebase(&self, id: &OperationId, version: i64, timestamp: i64) -> Result<()> {
        self.mutate("rebase", |tx| {
            SqliteOperationRepository::new(tx).rebase(id, version, timestamp)
        })
        .await
    }

    /// Dead-letter an operation and roll back its optimistic change
    pub async fn fail_operation(
        &self,
        operation: &Operation,
        reason: FailureReason,
        message: impl Into<String>,
        now: i64,
    ) -> Result<FailedOperation> {
        let failed = FailedOperation {
            operation: operation.clone(),
            reason,
            message: message.into(),
            failed_at: now,
        };
        self.mutate("fail_operation", |tx| {
            SqliteOperationRepository::new(tx).remove(&operation.id)?;
            SqliteFailedOperationRepository::new(tx).insert(&failed)?;
            rollback_in(tx, operation, now)?;
            Ok(())
        })
        .await?;
        Ok(failed)
    }

    /// Remove a pending operation and revert its optimistic change
    pub async fn cancel_operation(&self, id: &OperationId, now: i64) -> Result<Option<Operation>> {
        self.mutate("cancel_operation", |tx| {
            let operations = SqliteOperationRepository::new(tx);
            let Some(operation) = operations.get(id)? else {
                return Ok(None);
            };
            operations.remove(id)?;
            rollback_in(tx, &operation, now)?;
            Ok(Some(operation))
        })
        .await
    }

    /// Replace an operation with a persisted conflict record carrying its intent
    pub async fn route_to_conflict(&self, operation: &Operation, record: ConflictRecord) -> Result<ConflictRecord> {
        self.mutate("route_to_conflict", |tx| {
            SqliteOperationRepository::new(tx).remove(&operation.id)?;
            SqliteConflictRepository::new(tx).upsert(record)
        })
        .await
    }

    // -- dead letters --------------------------------------------------------

    pub async fn failed_operations(&self) -> Result<Vec<FailedOperation>> {
        self.read(|conn| SqliteFailedOperationRepository::new(conn).list())
            .await
    }

    pub async fn acknowledge_failure(&self, id: &OperationId) -> Result<bool> {
        self.mutate("acknowledge_failure", |tx| {
            SqliteFailedOperationRepository::new(tx).remove(id)
        })
        .await
    }

    // -- conflicts -----------------------------------------------------------

    pub async fn conflicts(&self, scope_id: Option<&str>) -> Result<Vec<ConflictRecord>> {
        self.read(|conn| SqliteConflictRepository::new(conn).list(scope_id))
            .await
    }

    pub async fn conflict(&self, item_id: &EntityId) -> Result<Option<ConflictRecord>> {
        self.read(|conn| SqliteConflictRepository::new(conn).get(item_id))
            .await
    }

    pub async fn conflict_count(&self) -> Result<usize> {
        self.read(|conn| SqliteConflictRepository::new(conn).count()).await
    }

    /// Persist a detected conflict and drop the operations it absorbed
    pub async fn record_conflict(&self, record: ConflictRecord, absorbed: &[OperationId]) -> Result<ConflictRecord> {
        self.mutate("record_conflict", |tx| {
            let operations = SqliteOperationRepository::new(tx);
            for id in absorbed {
                operations.remove(id)?;
            }
            SqliteConflictRepository::new(tx).upsert(record)
        })
        .await
    }

    /// Write a resolution outcome, drop the entity's queued operations and the record
    pub async fn apply_resolution(&self, conflict: &ConflictRecord, state: ResolvedState, now: i64) -> Result<()> {
        self.mutate("apply_resolution", |tx| {
            let entities = SqliteEntityRepository::new(tx);
            let conflicts = SqliteConflictRepository::new(tx);
            SqliteOperationRepository::new(tx).remove_for_entity(&conflict.item_id)?;
            conflicts.remove(&conflict.item_id)?;

            match state {
                ResolvedState::Stored(record) => {
                    if record.id != conflict.item_id {
                        entities.remove(&conflict.item_id)?;
                        rebind_in(tx, &conflict.item_id, &record.id)?;
                        conflicts.remove(&record.id)?;
                    }
                    entities.upsert(&record.into_cached(&conflict.kind, now))?;
                }
                ResolvedState::Removed => {
                    entities.remove(&conflict.item_id)?;
                }
            }
            Ok(())
        })
        .await
    }

    // -- session -------------------------------------------------------------

    pub async fn session(&self) -> Result<Option<SessionContext>> {
        self.read(|conn| SqliteSessionRepository::new(conn).get()).await
    }

    pub async fn set_session(&self, session: &SessionContext) -> Result<()> {
        self.mutate("set_session", |tx| SqliteSessionRepository::new(tx).set(session))
            .await
    }

    pub async fn clear_session(&self) -> Result<()> {
        self.mutate("clear_session", |tx| SqliteSessionRepository::new(tx).clear())
            .await
    }
}

fn capture_base(operation: &mut Operation, cached: &CachedEntity) {
    if !cached.is_optimistic() {
        operation.base_version = Some(cached.version);
    }
    operation.base_timestamp = cached.last_synced_at.map(|_| cached.updated_at);
}

/// Rewrite `from` as `to` in queued operations, cached entities and conflicts
fn rebind_in(conn: &Connection, from: &EntityId, to: &EntityId) -> Result<()> {
    let operations = SqliteOperationRepository::new(conn).rebind(from, to)?;
    let entities = SqliteEntityRepository::new(conn).rebind(from, to)?;
    let conflicts = SqliteConflictRepository::new(conn).rebind(from, to)?;
    debug!(%from, %to, operations, entities, conflicts, "Rebound optimistic id");
    Ok(())
}

/// Re-overlay the still-pending operations on an entity's cached copy
fn reapply_pending(conn: &Connection, entity_id: &EntityId) -> Result<()> {
    let entities = SqliteEntityRepository::new(conn);
    let Some(mut cached) = entities.get(entity_id)? else {
        return Ok(());
    };
    let pending = SqliteOperationRepository::new(conn).list_for_entity(entity_id)?;
    if pending.is_empty() {
        return Ok(());
    }
    for operation in pending {
        match operation.op_type {
            OperationType::Update => {
                for (key, value) in operation.payload {
                    cached.fields.insert(key, value);
                }
                cached.updated_at = cached.updated_at.max(operation.enqueued_at);
            }
            OperationType::Delete => cached.is_deleted = true,
            OperationType::Create => {}
        }
    }
    entities.upsert(&cached)
}

/// Undo the optimistic cache change of `operation`
fn rollback_in(conn: &Connection, operation: &Operation, now: i64) -> Result<()> {
    let entities = SqliteEntityRepository::new(conn);
    match operation.op_type {
        OperationType::Create => {
            if operation.entity_id.is_optimistic() {
                entities.remove(&operation.entity_id)?;
            }
        }
        OperationType::Update | OperationType::Delete => {
            let Some(mut cached) = entities.get(&operation.entity_id)? else {
                return Ok(());
            };
            restore_fields(&mut cached.fields, &operation.baseline);
            if operation.op_type == OperationType::Delete {
                cached.is_deleted = false;
            }
            cached.updated_at = now;
            entities.upsert(&cached)?;
            reapply_pending(conn, &operation.entity_id)?;
        }
    }
    Ok(())
}

fn restore_fields(fields: &mut Fields, baseline: &Fields) {
    for (key, value) in baseline {
        if value.is_null() {
            fields.remove(key);
        } else {
            fields.insert(key.clone(), value.clone());
        }
    }
}
