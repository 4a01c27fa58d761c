//! Divergence detection between queued mutations and server state.
//!
//! Only mutable fields are compared, after normalization. A field conflicts
//! when the server moved past the operation's baseline, the server value
//! differs from what this device wants to write, and the server value is not
//! simply the baseline the device started from.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::normalize::values_equal;
use crate::clock::Clock;
use crate::config::{EntitySchema, SyncConfig};
use crate::error::{Error, Result};
use crate::models::{
    ConflictRecord, ConflictSide, ConflictType, EntityId, EntityKind, Fields, Operation, OperationType,
};
use crate::remote::{RemoteBackend, RemoteError, RemoteRecord};
use crate::services::LocalStore;
use crate::util::duration_millis;

/// Outcome of comparing one operation with the server's copy
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Genuine divergence that needs a resolution
    Conflict(ConflictRecord),
    /// The server moved on without touching anything this operation cares
    /// about. `already_applied` is set when the server already holds every
    /// value the operation writes.
    FalsePositive { server: RemoteRecord, already_applied: bool },
    /// The row is gone and the operation was a delete
    Missing,
}

/// Whether the server copy is newer than the one the operation was made against
fn server_is_newer(operation: &Operation, server: &RemoteRecord) -> bool {
    match (operation.base_version, operation.base_timestamp) {
        (Some(version), _) => server.version > version,
        (None, Some(timestamp)) => server.updated_at > timestamp,
        (None, None) => true,
    }
}

fn local_side(operation: &Operation, data: Fields) -> ConflictSide {
    ConflictSide {
        data,
        timestamp: operation.enqueued_at,
        version: operation.base_version.unwrap_or(0),
    }
}

fn server_side(server: Option<&RemoteRecord>, schema: &EntitySchema, now: i64) -> ConflictSide {
    server.map_or(
        ConflictSide {
            data: Fields::new(),
            timestamp: now,
            version: 0,
        },
        |server| ConflictSide {
            data: schema.mutable_subset(&server.fields),
            timestamp: server.updated_at,
            version: server.version,
        },
    )
}

fn record(
    operation: &Operation,
    conflict_type: ConflictType,
    fields: Vec<String>,
    local: ConflictSide,
    server: ConflictSide,
    now: i64,
) -> ConflictRecord {
    ConflictRecord {
        item_id: operation.entity_id.clone(),
        kind: operation.kind.clone(),
        conflict_type,
        fields,
        local,
        server,
        parent_id: operation.parent_id.clone(),
        operation_id: Some(operation.id),
        scope_id: operation.account_id.clone(),
        detected_at: now,
    }
}

/// Compare `operation` with the server's copy (already in local field names).
///
/// Creates have no baseline to diverge from and are deduplicated by their
/// idempotency key instead, so they are rejected here.
pub fn classify(
    operation: &Operation,
    server: Option<&RemoteRecord>,
    schema: &EntitySchema,
    now: i64,
) -> Result<Detection> {
    match operation.op_type {
        OperationType::Create => Err(Error::InvalidInput(format!(
            "operation {} is a create and has nothing to compare",
            operation.id
        ))),
        OperationType::Update => Ok(classify_update(operation, server, schema, now)),
        OperationType::Delete => Ok(classify_delete(operation, server, schema, now)),
    }
}

fn classify_update(
    operation: &Operation,
    server: Option<&RemoteRecord>,
    schema: &EntitySchema,
    now: i64,
) -> Detection {
    let local = schema.mutable_subset(&operation.payload);
    let Some(server) = server else {
        let fields = local.keys().cloned().collect();
        return Detection::Conflict(record(
            operation,
            ConflictType::UpdateDelete,
            fields,
            local_side(operation, local),
            server_side(None, schema, now),
            now,
        ));
    };

    let already_applied = local
        .iter()
        .all(|(key, value)| values_equal(server.fields.get(key), Some(value)));

    let conflicting: Vec<String> = if server_is_newer(operation, server) {
        local
            .iter()
            .filter(|(key, value)| {
                let theirs = server.fields.get(*key);
                !values_equal(theirs, Some(*value))
                    && operation
                        .baseline
                        .get(*key)
                        .map_or(true, |base| !values_equal(theirs, Some(base)))
            })
            .map(|(key, _)| key.clone())
            .collect()
    } else {
        Vec::new()
    };

    if conflicting.is_empty() {
        return Detection::FalsePositive {
            server: server.clone(),
            already_applied,
        };
    }

    Detection::Conflict(record(
        operation,
        ConflictType::UpdateUpdate,
        conflicting,
        local_side(operation, local),
        server_side(Some(server), schema, now),
        now,
    ))
}

fn classify_delete(
    operation: &Operation,
    server: Option<&RemoteRecord>,
    schema: &EntitySchema,
    now: i64,
) -> Detection {
    let Some(server) = server else {
        return Detection::Missing;
    };
    let baseline = schema.mutable_subset(&operation.baseline);
    let changed: Vec<String> = if server_is_newer(operation, server) && !baseline.is_empty() {
        schema
            .mutable_fields
            .iter()
            .filter(|field| !values_equal(server.fields.get(*field), baseline.get(*field)))
            .cloned()
            .collect()
    } else {
        Vec::new()
    };

    if changed.is_empty() {
        return Detection::FalsePositive {
            server: server.clone(),
            already_applied: false,
        };
    }

    Detection::Conflict(record(
        operation,
        ConflictType::DeleteUpdate,
        changed,
        local_side(operation, baseline),
        server_side(Some(server), schema, now),
        now,
    ))
}

/// Fetch the current server copy under the request timeout, in local field names
pub async fn fetch_localized(
    backend: &dyn RemoteBackend,
    config: &SyncConfig,
    kind: &EntityKind,
    id: &EntityId,
) -> Result<Option<RemoteRecord>> {
    let schema = config.schema_for(kind)?;
    let timeout = config.request_timeout();
    let fetched = tokio::time::timeout(timeout, backend.fetch(kind, id))
        .await
        .unwrap_or(Err(RemoteError::Timeout(timeout)))?;
    Ok(fetched.map(|record| record.localized(schema)))
}

/// Fetches server state and turns divergences into persisted conflict records
#[derive(Clone)]
pub struct ConflictDetector {
    store: LocalStore,
    backend: Arc<dyn RemoteBackend>,
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
}

impl ConflictDetector {
    pub fn new(
        store: LocalStore,
        backend: Arc<dyn RemoteBackend>,
        config: Arc<SyncConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            backend,
            config,
            clock,
        }
    }

    /// Server copy in local field names, `None` if the row is gone
    pub async fn fetch_server(&self, kind: &EntityKind, id: &EntityId) -> Result<Option<RemoteRecord>> {
        fetch_localized(self.backend.as_ref(), &self.config, kind, id).await
    }

    /// Classify a single operation against the current server copy. Nothing is persisted.
    pub async fn detect_for_operation(&self, operation: &Operation) -> Result<Detection> {
        let schema = self.config.schema_for(&operation.kind)?;
        let server = match operation.op_type {
            OperationType::Create => None,
            OperationType::Update | OperationType::Delete => {
                self.fetch_server(&operation.kind, &operation.entity_id)
                    .await?
            }
        };
        let detection = classify(operation, server.as_ref(), schema, self.clock.now_millis())?;
        debug!(
            operation_id = %operation.id,
            entity_id = %operation.entity_id,
            detection = detection_name(&detection),
            "Compared operation with server"
        );
        Ok(detection)
    }

    /// Scan a scope for divergences.
    ///
    /// Every pending update or delete in the scope is compared with the
    /// server; genuine conflicts are persisted (one record per entity) and
    /// replace the operations that produced them, and false positives are
    /// rebased onto the server version. Recently synced entities without
    /// pending operations are refreshed from the server instead.
    pub async fn detect_conflicts(&self, scope_id: &str) -> Result<Vec<ConflictRecord>> {
        let mut detected: BTreeMap<EntityId, ConflictRecord> = BTreeMap::new();

        for operation in self.store.pending_for_account(scope_id).await? {
            if operation.op_type == OperationType::Create || operation.entity_id.is_optimistic() {
                continue;
            }
            match self.detect_for_operation(&operation).await? {
                Detection::Conflict(record) => {
                    let merged = self.store.route_to_conflict(&operation, record).await?;
                    warn!(
                        entity_id = %merged.item_id,
                        conflict_type = %merged.conflict_type,
                        fields = ?merged.fields,
                        "Conflict detected"
                    );
                    detected.insert(merged.item_id.clone(), merged);
                }
                Detection::FalsePositive { server, .. } => {
                    self.store
                        .rebase(&operation.id, server.version, server.updated_at)
                        .await?;
                }
                Detection::Missing => {}
            }
        }

        let refreshed = self.refresh_recent(scope_id).await?;
        info!(scope_id, conflicts = detected.len(), refreshed, "Conflict scan finished");
        Ok(detected.into_values().collect())
    }

    /// Read-through refresh of recently synced entities; returns how many changed
    async fn refresh_recent(&self, scope_id: &str) -> Result<usize> {
        let now = self.clock.now_millis();
        let since = now - duration_millis(self.config.recent_sync_window());
        let mut refreshed = 0;
        for cached in self.store.recently_synced(scope_id, since).await? {
            if cached.has_local_changes() {
                continue;
            }
            match self.fetch_server(&cached.kind, &cached.id).await? {
                Some(server) => {
                    if self.store.refresh_if_newer(&cached.kind, server, now).await? {
                        refreshed += 1;
                    }
                }
                None => {
                    if self.store.evict_if_clean(&cached.id).await? {
                        refreshed += 1;
                    }
                }
            }
        }
        Ok(refreshed)
    }
}

const fn detection_name(detection: &Detection) -> &'static str {
    match detection {
        Detection::Conflict(_) => "conflict",
        Detection::FalsePositive {
            already_applied: true,
            ..
        } => "already_applied",
        Detection::FalsePositive { .. } => "false_positive",
        Detection::Missing => "missing",
    }
}
