//! Applying a chosen resolution to a conflict record

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::detector::fetch_localized;
use crate::clock::Clock;
use crate::config::{EntitySchema, SyncConfig};
use crate::error::{Error, Result};
use crate::models::{ConflictRecord, ConflictType, EntityId, Fields, Resolution};
use crate::remote::{CreateRequest, DeleteRequest, RemoteBackend, RemoteError, UpdateRequest};
use crate::services::{LocalStore, ResolvedState};

/// Outcome of [`ConflictResolver::resolve_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveReport {
    pub resolved: Vec<EntityId>,
    /// Entity and the error that kept its record in place
    pub failed: Vec<(EntityId, String)>,
}

#[derive(Clone)]
pub struct ConflictResolver {
    store: LocalStore,
    backend: Arc<dyn RemoteBackend>,
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
}

impl ConflictResolver {
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

    /// Resolve one conflict.
    ///
    /// The remote write happens first; only when it succeeds is the cache
    /// updated, the entity's queued operations dropped and the record
    /// removed. On failure the record stays and the error is returned.
    pub async fn apply_resolution(&self, conflict: &ConflictRecord, resolution: Resolution) -> Result<()> {
        let conflict = self
            .store
            .conflict(&conflict.item_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict for {}", conflict.item_id)))?;
        let schema = self.config.schema_for(&conflict.kind)?;
        let values = resolved_values(&conflict, &resolution, schema)?;

        let state = match values {
            None => self.keep_server(&conflict).await?,
            Some(values) => self.write_remote(&conflict, &resolution, values, schema).await?,
        };

        let now = self.clock.now_millis();
        self.store.apply_resolution(&conflict, state, now).await?;
        info!(
            entity_id = %conflict.item_id,
            conflict_type = %conflict.conflict_type,
            strategy = resolution.name(),
            "Conflict resolved"
        );
        Ok(())
    }

    /// Apply `default` to every outstanding record, one attempt per entity
    pub async fn resolve_all(&self, default: Resolution) -> Result<ResolveReport> {
        let mut report = ResolveReport::default();
        let mut seen = HashSet::new();
        for conflict in self.store.conflicts(None).await? {
            if !seen.insert(conflict.item_id.clone()) {
                continue;
            }
            match self.apply_resolution(&conflict, default.clone()).await {
                Ok(()) => report.resolved.push(conflict.item_id),
                Err(error) => {
                    warn!(entity_id = %conflict.item_id, %error, "Failed to resolve conflict");
                    report.failed.push((conflict.item_id, error.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn updated_by(&self) -> Result<String> {
        self.store
            .session()
            .await?
            .map(|session| session.user_id)
            .ok_or_else(|| Error::MissingContext("no cached session to attribute the resolution to".into()))
    }

    /// The server copy wins; nothing is written remotely.
    ///
    /// The row is read again rather than taken from the record, since the
    /// server may have moved on after the conflict was detected.
    async fn keep_server(&self, conflict: &ConflictRecord) -> Result<ResolvedState> {
        let current = fetch_localized(self.backend.as_ref(), &self.config, &conflict.kind, &conflict.item_id).await?;
        Ok(current.map_or(ResolvedState::Removed, ResolvedState::Stored))
    }

    async fn write_remote(
        &self,
        conflict: &ConflictRecord,
        resolution: &Resolution,
        values: Fields,
        schema: &EntitySchema,
    ) -> Result<ResolvedState> {
        let updated_by = self.updated_by().await?;
        let timeout = self.config.request_timeout();
        let kind = &conflict.kind;

        match conflict.conflict_type {
            ConflictType::DeleteUpdate if matches!(resolution, Resolution::KeepLocal) => {
                let request = DeleteRequest {
                    version: Some(conflict.server.version),
                    updated_by,
                };
                let deleted = tokio::time::timeout(timeout, self.backend.delete(kind, &conflict.item_id, request))
                    .await
                    .unwrap_or(Err(RemoteError::Timeout(timeout)));
                match deleted {
                    Ok(()) | Err(RemoteError::NotFound) => Ok(ResolvedState::Removed),
                    Err(error) => Err(error.into()),
                }
            }
            ConflictType::UpdateUpdate | ConflictType::DeleteUpdate => {
                let request = UpdateRequest {
                    fields: schema.to_remote(&values),
                    version: Some(conflict.server.version),
                    updated_by,
                };
                let record = tokio::time::timeout(timeout, self.backend.update(kind, &conflict.item_id, request))
                    .await
                    .unwrap_or(Err(RemoteError::Timeout(timeout)))?;
                Ok(ResolvedState::Stored(record.localized(schema)))
            }
            ConflictType::UpdateDelete => {
                // Re-create from the last cached copy with the chosen values on top.
                let mut fields = self
                    .store
                    .cached(&conflict.item_id)
                    .await?
                    .map(|cached| schema.mutable_subset(&cached.fields))
                    .unwrap_or_default();
                fields.extend(values);
                let request = CreateRequest {
                    idempotency_key: format!("{}:resolve:{}", conflict.item_id, conflict.detected_at),
                    scope_id: conflict.scope_id.clone(),
                    parent_id: conflict.parent_id.clone(),
                    fields: schema.to_remote(&fields),
                    updated_by,
                };
                let record = tokio::time::timeout(timeout, self.backend.create(kind, request))
                    .await
                    .unwrap_or(Err(RemoteError::Timeout(timeout)))?;
                Ok(ResolvedState::Stored(record.localized(schema)))
            }
        }
    }
}

/// Values to write for `resolution`; `None` when the server copy is kept as is
fn resolved_values(conflict: &ConflictRecord, resolution: &Resolution, schema: &EntitySchema) -> Result<Option<Fields>> {
    match resolution {
        Resolution::KeepServer => Ok(None),
        Resolution::KeepLocal => Ok(Some(conflict.local.data.clone())),
        Resolution::Merge(fields) => {
            let mut values = Fields::new();
            for field in fields {
                if !schema.is_mutable(field) {
                    return Err(Error::InvalidInput(format!(
                        "field '{field}' is not writable on '{}'",
                        conflict.kind
                    )));
                }
                let value = conflict.local.data.get(field).cloned().unwrap_or(Value::Null);
                values.insert(field.clone(), value);
            }
            if values.is_empty() {
                Ok(None)
            } else {
                Ok(Some(values))
            }
        }
        Resolution::Manual(values) => {
            schema.check_payload(values)?;
            Ok(Some(values.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{
        ConflictSide, EntityKind, Identity, Operation, OperationId, OperationType, SessionContext,
    };
    use crate::remote::{Fault, InMemoryBackend, RemoteRecord};
    use crate::services::LocalStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn kind() -> EntityKind {
        EntityKind::new("items").unwrap()
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn config() -> Arc<SyncConfig> {
        Arc::new(SyncConfig::default().with_entity(EntitySchema::new(kind(), ["name", "price"])))
    }

    struct Harness {
        store: LocalStore,
        backend: Arc<InMemoryBackend>,
        resolver: ConflictResolver,
    }

    async fn harness() -> Harness {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .set_session(&SessionContext {
                account_id: "acct".into(),
                user_id: "me".into(),
                cached_at: 1,
            })
            .await
            .unwrap();
        let backend = Arc::new(InMemoryBackend::new().with_identity(Identity::new("acct", "me")));
        let resolver = ConflictResolver::new(
            store.clone(),
            backend.clone(),
            config(),
            Arc::new(ManualClock::new(1_000)),
        );
        Harness {
            store,
            backend,
            resolver,
        }
    }

    fn server_row(name: &str, version: i64) -> RemoteRecord {
        RemoteRecord {
            id: EntityId::new("row-7").unwrap(),
            scope_id: "acct".into(),
            parent_id: None,
            fields: fields(json!({"name": name, "price": 2})),
            version,
            updated_by: Some("other".into()),
            updated_at: 500,
        }
    }

    async fn seed_conflict(harness: &Harness, conflict_type: ConflictType) -> ConflictRecord {
        harness.backend.seed(&kind(), server_row("Chair", 2));
        harness
            .store
            .cache_remote(&kind(), server_row("Lamp", 1), 100)
            .await
            .unwrap();
        let queued = harness
            .store
            .enqueue(Operation {
                id: OperationId::new(),
                seq: 0,
                op_type: OperationType::Update,
                kind: kind(),
                entity_id: EntityId::new("row-7").unwrap(),
                parent_id: None,
                payload: fields(json!({"name": "Desk"})),
                baseline: Fields::new(),
                account_id: "acct".into(),
                user_id: "me".into(),
                base_version: None,
                base_timestamp: None,
                enqueued_at: 200,
                retry_count: 0,
                last_error: None,
                next_attempt_at: None,
            })
            .await
            .unwrap();
        let record = ConflictRecord {
            item_id: queued.entity_id.clone(),
            kind: kind(),
            conflict_type,
            fields: vec!["name".into()],
            local: ConflictSide {
                data: fields(json!({"name": "Desk"})),
                timestamp: 200,
                version: 1,
            },
            server: ConflictSide {
                data: fields(json!({"name": "Chair", "price": 2})),
                timestamp: 500,
                version: 2,
            },
            parent_id: None,
            operation_id: Some(queued.id),
            scope_id: "acct".into(),
            detected_at: 900,
        };
        harness.store.route_to_conflict(&queued, record).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_local_writes_against_server_version() {
        let harness = harness().await;
        let conflict = seed_conflict(&harness, ConflictType::UpdateUpdate).await;

        harness
            .resolver
            .apply_resolution(&conflict, Resolution::KeepLocal)
            .await
            .unwrap();

        let server = harness.backend.get(&kind(), &conflict.item_id).unwrap();
        assert_eq!(server.fields["name"], json!("Desk"));
        assert_eq!(server.version, 3);
        let cached = harness.store.cached(&conflict.item_id).await.unwrap().unwrap();
        assert_eq!(cached.fields["name"], json!("Desk"));
        assert_eq!(cached.version, 3);
        assert_eq!(harness.store.conflict_count().await.unwrap(), 0);
        assert_eq!(harness.store.queue_length().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_server_needs_no_remote_write() {
        let harness = harness().await;
        let conflict = seed_conflict(&harness, ConflictType::UpdateUpdate).await;

        harness
            .resolver
            .apply_resolution(&conflict, Resolution::KeepServer)
            .await
            .unwrap();

        assert!(harness.backend.writes().is_empty());
        let cached = harness.store.cached(&conflict.item_id).await.unwrap().unwrap();
        assert_eq!(cached.fields["name"], json!("Chair"));
        assert_eq!(cached.version, 2);
        assert_eq!(harness.store.conflict_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_server_takes_the_latest_server_copy() {
        let harness = harness().await;
        let conflict = seed_conflict(&harness, ConflictType::UpdateUpdate).await;
        harness
            .backend
            .modify(&kind(), &conflict.item_id, &fields(json!({"name": "Sofa"})), "other")
            .unwrap();

        harness
            .resolver
            .apply_resolution(&conflict, Resolution::KeepServer)
            .await
            .unwrap();

        assert!(harness.backend.writes().is_empty());
        let server = harness.backend.get(&kind(), &conflict.item_id).unwrap();
        let cached = harness.store.cached(&conflict.item_id).await.unwrap().unwrap();
        assert_eq!(cached.fields["name"], json!("Sofa"));
        assert_eq!(cached.version, server.version);
        assert_eq!(cached.version, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_server_drops_cache_when_row_is_gone() {
        let harness = harness().await;
        let conflict = seed_conflict(&harness, ConflictType::UpdateUpdate).await;
        harness.backend.remove(&kind(), &conflict.item_id);

        harness
            .resolver
            .apply_resolution(&conflict, Resolution::KeepServer)
            .await
            .unwrap();

        assert!(harness.store.cached(&conflict.item_id).await.unwrap().is_none());
        assert_eq!(harness.store.conflict_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_server_keeps_record_when_server_is_unreachable() {
        let harness = harness().await;
        let conflict = seed_conflict(&harness, ConflictType::UpdateUpdate).await;
        harness.backend.set_unreachable(true);

        let error = harness
            .resolver
            .apply_resolution(&conflict, Resolution::KeepServer)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Remote(RemoteError::Network(_))));
        assert_eq!(harness.store.conflict_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_remote_write_keeps_record() {
        let harness = harness().await;
        let conflict = seed_conflict(&harness, ConflictType::UpdateUpdate).await;
        harness
            .backend
            .push_fault(Fault::Fail(RemoteError::Network("offline".into())));

        let error = harness
            .resolver
            .apply_resolution(&conflict, Resolution::Merge(vec!["name".into()]))
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Remote(RemoteError::Network(_))));
        assert_eq!(harness.store.conflict_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_values_outside_allowlist_are_rejected() {
        let harness = harness().await;
        let conflict = seed_conflict(&harness, ConflictType::UpdateUpdate).await;

        let error = harness
            .resolver
            .apply_resolution(&conflict, Resolution::Manual(fields(json!({"owner": "x"}))))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
        assert!(harness.backend.writes().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_local_after_server_delete_recreates_and_rebinds() {
        let harness = harness().await;
        let conflict = seed_conflict(&harness, ConflictType::UpdateDelete).await;
        harness.backend.remove(&kind(), &conflict.item_id);

        harness
            .resolver
            .apply_resolution(&conflict, Resolution::KeepLocal)
            .await
            .unwrap();

        let records = harness.backend.records(&kind());
        assert_eq!(records.len(), 1);
        let recreated = &records[0];
        assert_ne!(recreated.id, conflict.item_id);
        assert_eq!(recreated.fields["name"], json!("Desk"));
        assert!(harness.store.cached(&conflict.item_id).await.unwrap().is_none());
        assert!(harness.store.cached(&recreated.id).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_all_handles_each_entity_once() {
        let harness = harness().await;
        seed_conflict(&harness, ConflictType::UpdateUpdate).await;

        let report = harness
            .resolver
            .resolve_all(Resolution::KeepServer)
            .await
            .unwrap();
        assert_eq!(report.resolved, vec![EntityId::new("row-7").unwrap()]);
        assert!(report.failed.is_empty());
        assert_eq!(harness.store.conflict_count().await.unwrap(), 0);
    }
}
