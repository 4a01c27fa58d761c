//! In-process authoritative backend for tests and local development.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{CreateRequest, DeleteRequest, RemoteBackend, RemoteError, RemoteRecord, UpdateRequest};
use crate::models::{EntityId, EntityKind, Fields, Identity};
use crate::util::now_millis;

/// Injected failure for the next mutating call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail without touching state
    Fail(RemoteError),
    /// Apply the write, then report a network error as if the response was lost
    LoseResponse,
}

/// One call observed by the backend, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Create { kind: EntityKind, key: String },
    Fetch { kind: EntityKind, id: EntityId },
    Update { kind: EntityKind, id: EntityId },
    Delete { kind: EntityKind, id: EntityId },
    Identity,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<(EntityKind, EntityId), RemoteRecord>,
    idempotency: HashMap<String, EntityId>,
    next_id: u64,
    identity: Option<Identity>,
    faults: VecDeque<Fault>,
    rejections: Vec<(String, serde_json::Value, String)>,
    unreachable: bool,
    calls: Vec<RemoteCall>,
}

impl MemoryState {
    fn check_rejections(&self, fields: &Fields) -> Result<(), RemoteError> {
        for (field, value, message) in &self.rejections {
            if fields.get(field) == Some(value) {
                return Err(RemoteError::Rejected {
                    status: 422,
                    message: message.clone(),
                });
            }
        }
        Ok(())
    }

    /// Consume the next fault; `Ok(true)` means the response should be lost
    fn take_fault(&mut self) -> Result<bool, RemoteError> {
        if self.unreachable {
            return Err(RemoteError::Network("backend unreachable".to_string()));
        }
        match self.faults.pop_front() {
            Some(Fault::Fail(error)) => Err(error),
            Some(Fault::LoseResponse) => Ok(true),
            None => Ok(false),
        }
    }
}

fn lost() -> RemoteError {
    RemoteError::Network("connection reset before response".to_string())
}

/// Versioned, idempotent record store behind the [`RemoteBackend`] seam
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_identity(self, identity: Identity) -> Self {
        self.state().identity = Some(identity);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue a fault for the next create, update or delete
    pub fn push_fault(&self, fault: Fault) {
        self.state().faults.push_back(fault);
    }

    /// Reject every write where `field` equals `value`
    pub fn reject_when(&self, field: impl Into<String>, value: serde_json::Value, message: impl Into<String>) {
        self.state()
            .rejections
            .push((field.into(), value, message.into()));
    }

    /// Make every call fail with a network error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Seed a row as if it already existed on the server
    pub fn seed(&self, kind: &EntityKind, record: RemoteRecord) {
        self.state()
            .records
            .insert((kind.clone(), record.id.clone()), record);
    }

    /// Change a row as another device would, bumping its version
    pub fn modify(&self, kind: &EntityKind, id: &EntityId, patch: &Fields, updated_by: &str) -> Option<RemoteRecord> {
        let mut state = self.state();
        let record = state.records.get_mut(&(kind.clone(), id.clone()))?;
        for (key, value) in patch {
            record.fields.insert(key.clone(), value.clone());
        }
        record.version += 1;
        record.updated_by = Some(updated_by.to_string());
        record.updated_at = now_millis();
        Some(record.clone())
    }

    /// Delete a row as another device would
    pub fn remove(&self, kind: &EntityKind, id: &EntityId) -> Option<RemoteRecord> {
        self.state().records.remove(&(kind.clone(), id.clone()))
    }

    pub fn get(&self, kind: &EntityKind, id: &EntityId) -> Option<RemoteRecord> {
        self.state().records.get(&(kind.clone(), id.clone())).cloned()
    }

    pub fn records(&self, kind: &EntityKind) -> Vec<RemoteRecord> {
        self.state()
            .records
            .iter()
            .filter(|((record_kind, _), _)| record_kind == kind)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    /// Writes observed so far, ignoring reads
    pub fn writes(&self) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|call| {
                matches!(
                    call,
                    RemoteCall::Create { .. } | RemoteCall::Update { .. } | RemoteCall::Delete { .. }
                )
            })
            .collect()
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn create(&self, kind: &EntityKind, request: CreateRequest) -> Result<RemoteRecord, RemoteError> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Create {
            kind: kind.clone(),
            key: request.idempotency_key.clone(),
        });
        let lose = state.take_fault()?;

        if let Some(existing) = state.idempotency.get(&request.idempotency_key).cloned() {
            let record = state
                .records
                .get(&(kind.clone(), existing))
                .cloned()
                .ok_or(RemoteError::NotFound)?;
            return if lose { Err(lost()) } else { Ok(record) };
        }

        state.check_rejections(&request.fields)?;
        state.next_id += 1;
        let id = EntityId::new(format!("srv-{}", state.next_id))
            .map_err(|error| RemoteError::InvalidResponse(error.to_string()))?;
        let record = RemoteRecord {
            id: id.clone(),
            scope_id: request.scope_id,
            parent_id: request.parent_id,
            fields: request.fields,
            version: 1,
            updated_by: Some(request.updated_by),
            updated_at: now_millis(),
        };
        state.idempotency.insert(request.idempotency_key, id.clone());
        state.records.insert((kind.clone(), id), record.clone());

        if lose {
            Err(lost())
        } else {
            Ok(record)
        }
    }

    async fn fetch(&self, kind: &EntityKind, id: &EntityId) -> Result<Option<RemoteRecord>, RemoteError> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Fetch {
            kind: kind.clone(),
            id: id.clone(),
        });
        if state.unreachable {
            return Err(RemoteError::Network("backend unreachable".to_string()));
        }
        Ok(state.records.get(&(kind.clone(), id.clone())).cloned())
    }

    async fn update(
        &self,
        kind: &EntityKind,
        id: &EntityId,
        request: UpdateRequest,
    ) -> Result<RemoteRecord, RemoteError> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Update {
            kind: kind.clone(),
            id: id.clone(),
        });
        let lose = state.take_fault()?;
        state.check_rejections(&request.fields)?;

        let record = state
            .records
            .get_mut(&(kind.clone(), id.clone()))
            .ok_or(RemoteError::NotFound)?;
        if let Some(expected) = request.version {
            if expected != record.version {
                return Err(RemoteError::Conflict {
                    server_version: Some(record.version),
                });
            }
        }
        for (key, value) in request.fields {
            record.fields.insert(key, value);
        }
        record.version += 1;
        record.updated_by = Some(request.updated_by);
        record.updated_at = now_millis();
        let record = record.clone();

        if lose {
            Err(lost())
        } else {
            Ok(record)
        }
    }

    async fn delete(&self, kind: &EntityKind, id: &EntityId, request: DeleteRequest) -> Result<(), RemoteError> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Delete {
            kind: kind.clone(),
            id: id.clone(),
        });
        let lose = state.take_fault()?;

        let key = (kind.clone(), id.clone());
        let current = state.records.get(&key).ok_or(RemoteError::NotFound)?;
        if let Some(expected) = request.version {
            if expected != current.version {
                return Err(RemoteError::Conflict {
                    server_version: Some(current.version),
                });
            }
        }
        state.records.remove(&key);

        if lose {
            Err(lost())
        } else {
            Ok(())
        }
    }

    async fn current_identity(&self) -> Result<Identity, RemoteError> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Identity);
        if state.unreachable {
            return Err(RemoteError::Network("backend unreachable".to_string()));
        }
        state.identity.clone().ok_or(RemoteError::Unauthorized(401))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kind() -> EntityKind {
        EntityKind::new("items").unwrap()
    }

    fn create_request(key: &str) -> CreateRequest {
        CreateRequest {
            idempotency_key: key.to_string(),
            scope_id: "acct".into(),
            parent_id: None,
            fields: json!({"name": "Lamp"}).as_object().cloned().unwrap(),
            updated_by: "user".into(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replayed_create_returns_original_row() {
        let backend = InMemoryBackend::new();
        backend.push_fault(Fault::LoseResponse);

        let first = backend.create(&kind(), create_request("local-1")).await;
        assert!(first.is_err());
        let second = backend.create(&kind(), create_request("local-1")).await.unwrap();

        assert_eq!(backend.records(&kind()), vec![second]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_update_reports_server_version() {
        let backend = InMemoryBackend::new();
        let record = backend.create(&kind(), create_request("k")).await.unwrap();
        backend.modify(&kind(), &record.id, &Fields::new(), "other");

        let error = backend
            .update(
                &kind(),
                &record.id,
                UpdateRequest {
                    fields: Fields::new(),
                    version: Some(1),
                    updated_by: "user".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(
            error,
            RemoteError::Conflict {
                server_version: Some(2)
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejection_rules_apply_to_matching_fields() {
        let backend = InMemoryBackend::new();
        backend.reject_when("name", json!("Lamp"), "duplicate name");
        let error = backend.create(&kind(), create_request("k")).await.unwrap_err();
        assert!(matches!(error, RemoteError::Rejected { .. }));
        assert!(backend.records(&kind()).is_empty());
    }
}
