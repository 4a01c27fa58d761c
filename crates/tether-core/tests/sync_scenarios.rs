//! End-to-end sync scenarios against the in-memory backend.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tether_core::clock::ManualClock;
use tether_core::models::{ConflictType, FailureReason, Fields, OperationType};
use tether_core::network::StaticProbe;
use tether_core::queue::PassOutcome;
use tether_core::remote::{Fault, InMemoryBackend, RemoteCall, RemoteRecord};
use tether_core::{
    EntityId, EntityKind, EntitySchema, Error, Identity, LocalStore, OperationDraft, OperationErrorKind,
    Resolution, SyncConfig, SyncEngine,
};

fn items() -> EntityKind {
    EntityKind::new("items").unwrap()
}

fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap()
}

struct Device {
    engine: SyncEngine,
    probe: Arc<StaticProbe>,
    clock: Arc<ManualClock>,
}

impl Device {
    async fn new(backend: &Arc<InMemoryBackend>, store: LocalStore, online: bool) -> Self {
        let mut config = SyncConfig::default().with_entity(EntitySchema::new(items(), ["name", "note", "list_id"]));
        config.retry.base_delay_ms = 10;
        config.retry.max_delay_ms = 100;
        config.retry.max_retries = 3;

        let probe = Arc::new(StaticProbe::new(online));
        let clock = Arc::new(ManualClock::new(1_000_000));
        let engine = SyncEngine::builder(config)
            .store(store)
            .backend(backend.clone())
            .probe(probe.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        engine.set_session(Identity::new("acct", "me")).await.unwrap();
        engine.check_connectivity().await;
        Self { engine, probe, clock }
    }

    async fn in_memory(backend: &Arc<InMemoryBackend>) -> Self {
        Self::new(backend, LocalStore::open_in_memory().await.unwrap(), true).await
    }

    async fn create(&self, value: Value) -> EntityId {
        self.engine
            .enqueue(OperationDraft::create(items(), fields(value)))
            .await
            .unwrap();
        let pending = self.engine.pending_operations().await.unwrap();
        pending.last().unwrap().entity_id.clone()
    }

    async fn update(&self, id: &EntityId, value: Value) {
        self.engine
            .enqueue(OperationDraft::update(items(), id.clone(), fields(value)))
            .await
            .unwrap();
    }

    async fn go_online(&self) {
        self.probe.set_reachable(true);
        assert!(self.engine.check_connectivity().await.is_online);
    }
}

fn seed(backend: &InMemoryBackend, id: &str, value: Value) -> EntityId {
    let id = EntityId::new(id).unwrap();
    backend.seed(
        &items(),
        RemoteRecord {
            id: id.clone(),
            scope_id: "acct".into(),
            parent_id: None,
            fields: fields(value),
            version: 1,
            updated_by: Some("seed".into()),
            updated_at: 1,
        },
    );
    id
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_create_after_lost_response_makes_one_row() {
    let backend = Arc::new(InMemoryBackend::new());
    let device = Device::in_memory(&backend).await;
    let local_id = device.create(json!({ "name": "Lamp" })).await;

    backend.push_fault(Fault::LoseResponse);
    let first = device.engine.process_queue().await.unwrap();
    assert!(matches!(first.outcome, PassOutcome::Stalled { .. }));
    assert_eq!(first.remaining, 1);

    device.clock.advance(10);
    let second = device.engine.process_queue().await.unwrap();
    assert_eq!(second.succeeded, 1);

    let records = backend.records(&items());
    assert_eq!(records.len(), 1);
    let keys: Vec<_> = backend
        .writes()
        .into_iter()
        .filter_map(|call| match call {
            RemoteCall::Create { key, .. } => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(keys, vec![local_id.to_string(), local_id.to_string()]);
    assert!(device.engine.store().cached(&local_id).await.unwrap().is_none());
    assert!(device.engine.store().cached(&records[0].id).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_update_after_lost_response_is_not_a_conflict() {
    let backend = Arc::new(InMemoryBackend::new());
    let id = seed(&backend, "row-1", json!({ "name": "old" }));
    let device = Device::in_memory(&backend).await;
    device.engine.get_entity(&items(), &id).await.unwrap();
    device.update(&id, json!({ "name": "new" })).await;

    backend.push_fault(Fault::LoseResponse);
    device.engine.process_queue().await.unwrap();
    assert_eq!(backend.get(&items(), &id).unwrap().version, 2);

    device.clock.advance(10);
    let report = device.engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(report.conflicts.is_empty());
    assert!(device.engine.conflicts(None).await.unwrap().is_empty());
    // The replay never wrote a second time.
    assert_eq!(backend.get(&items(), &id).unwrap().version, 2);

    let cached = device.engine.store().cached(&id).await.unwrap().unwrap();
    assert_eq!(cached.version, 2);
    assert_eq!(cached.fields["name"], json!("new"));
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_delete_of_a_missing_row_succeeds() {
    let backend = Arc::new(InMemoryBackend::new());
    let id = seed(&backend, "row-1", json!({ "name": "old" }));
    let device = Device::in_memory(&backend).await;
    device.engine.get_entity(&items(), &id).await.unwrap();
    device
        .engine
        .enqueue(OperationDraft::delete(items(), id.clone()))
        .await
        .unwrap();

    backend.push_fault(Fault::LoseResponse);
    device.engine.process_queue().await.unwrap();
    assert!(backend.get(&items(), &id).is_none());

    device.clock.advance(10);
    let report = device.engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.remaining, 0);
    assert!(device.engine.store().cached(&id).await.unwrap().is_none());
    assert!(device.engine.failed_operations().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn dependent_create_waits_for_and_adopts_the_real_id() {
    let backend = Arc::new(InMemoryBackend::new());
    let device = Device::new(&backend, LocalStore::open_in_memory().await.unwrap(), false).await;

    let list = device.create(json!({ "name": "Groceries" })).await;
    device
        .engine
        .enqueue(
            OperationDraft::create(items(), fields(json!({ "name": "Milk", "list_id": list.as_str() })))
                .with_parent(list.clone()),
        )
        .await
        .unwrap();
    assert_eq!(device.engine.list_children(&list).await.unwrap().len(), 1);

    device.go_online().await;
    let report = device.engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 2);

    let records = backend.records(&items());
    let parent = records.iter().find(|record| record.fields["name"] == json!("Groceries")).unwrap();
    let child = records.iter().find(|record| record.fields["name"] == json!("Milk")).unwrap();
    assert_eq!(child.parent_id.as_ref(), Some(&parent.id));
    assert_eq!(child.fields["list_id"], json!(parent.id.as_str()));

    let writes = backend.writes();
    assert!(matches!(&writes[0], RemoteCall::Create { key, .. } if key == list.as_str()));
    assert_eq!(device.engine.list_children(&parent.id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_string_on_server_is_not_a_conflict() {
    let backend = Arc::new(InMemoryBackend::new());
    let id = seed(&backend, "row-1", json!({ "name": "Lamp" }));
    let device = Device::in_memory(&backend).await;
    device.engine.get_entity(&items(), &id).await.unwrap();
    device.update(&id, json!({ "name": "Desk lamp", "note": null })).await;

    // Another client touches the row, leaving an empty note behind.
    backend.modify(&items(), &id, &fields(json!({ "note": "" })), "other");

    assert!(device.engine.detect_conflicts("acct").await.unwrap().is_empty());
    let report = device.engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(backend.get(&items(), &id).unwrap().fields["name"], json!("Desk lamp"));
    assert_eq!(device.engine.status().await.unwrap().conflicts, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_create_is_replaced_by_the_server_row() {
    let backend = Arc::new(InMemoryBackend::new());
    let device = Device::new(&backend, LocalStore::open_in_memory().await.unwrap(), false).await;

    let local_id = device.create(json!({ "name": "Offline note" })).await;
    assert!(local_id.is_optimistic());
    assert_eq!(device.engine.queue_snapshot().length, 1);
    let offline = device.engine.process_queue().await.unwrap();
    assert_eq!(offline.outcome, PassOutcome::Offline);

    device.go_online().await;
    let report = device.engine.process_queue().await.unwrap();
    assert_eq!(report.outcome, PassOutcome::Drained);
    assert_eq!(device.engine.queue_snapshot().length, 0);

    let cached = device.engine.list_entities("acct", Some(&items())).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert!(!cached[0].is_optimistic());
    assert_eq!(cached[0].id, backend.records(&items())[0].id);
    assert!(device.engine.conflicts(None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_edits_conflict_once_and_keep_server_converges() {
    let backend = Arc::new(InMemoryBackend::new());
    let id = seed(&backend, "row-1", json!({ "name": "original" }));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device-b.db");

    let device_a = Device::in_memory(&backend).await;
    let device_b = Device::new(&backend, LocalStore::open_path(&path).await.unwrap(), true).await;
    device_a.engine.get_entity(&items(), &id).await.unwrap();
    device_b.engine.get_entity(&items(), &id).await.unwrap();

    device_a.update(&id, json!({ "name": "from A" })).await;
    device_b.update(&id, json!({ "name": "from B" })).await;

    assert_eq!(device_a.engine.process_queue().await.unwrap().succeeded, 1);
    let report = device_b.engine.process_queue().await.unwrap();
    assert_eq!(report.conflicts, vec![id.clone()]);
    assert!(device_a.engine.conflicts(None).await.unwrap().is_empty());

    // The record survives a restart of device B.
    drop(device_b);
    let device_b = Device::new(&backend, LocalStore::open_path(&path).await.unwrap(), true).await;
    let conflicts = device_b.engine.conflicts(Some("acct")).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::UpdateUpdate);
    assert_eq!(conflicts[0].fields, vec!["name".to_string()]);
    assert_eq!(conflicts[0].server.data["name"], json!("from A"));
    assert_eq!(conflicts[0].local.data["name"], json!("from B"));

    let writes_before = backend.writes().len();
    device_b.engine.resolve(&id, Resolution::KeepServer).await.unwrap();
    assert_eq!(backend.writes().len(), writes_before);
    assert!(device_b.engine.conflicts(None).await.unwrap().is_empty());

    let a = device_a.engine.get_entity(&items(), &id).await.unwrap().unwrap();
    let b = device_b.engine.get_entity(&items(), &id).await.unwrap().unwrap();
    assert_eq!(a.fields["name"], json!("from A"));
    assert_eq!(b.fields["name"], a.fields["name"]);
    assert_eq!(b.version, a.version);
}

#[tokio::test(flavor = "multi_thread")]
async fn permanent_failure_in_the_middle_does_not_block_the_rest() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.reject_when("name", json!("bad"), "name is reserved");
    let device = Device::in_memory(&backend).await;

    device.create(json!({ "name": "one" })).await;
    let rejected = device.create(json!({ "name": "bad" })).await;
    device.create(json!({ "name": "three" })).await;

    let report = device.engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].1, FailureReason::PermanentValidation);

    let names: Vec<_> = backend
        .records(&items())
        .into_iter()
        .map(|record| record.fields["name"].clone())
        .collect();
    assert_eq!(names, vec![json!("one"), json!("three")]);

    let failed = device.engine.failed_operations().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].operation.op_type, OperationType::Create);
    assert!(failed[0].message.contains("name is reserved"));
    assert!(device.engine.store().cached(&rejected).await.unwrap().is_none());
    assert_eq!(device.engine.queue_snapshot().failed_count, 1);

    assert!(device.engine.acknowledge_failure(&failed[0].operation.id).await.unwrap());
    assert_eq!(device.engine.status().await.unwrap().queue.failed_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_enqueue_without_session_needs_context() {
    let backend = Arc::new(InMemoryBackend::new().with_identity(Identity::new("acct", "me")));
    let device = Device::new(&backend, LocalStore::open_in_memory().await.unwrap(), false).await;
    device.engine.clear_session().await.unwrap();

    let error = device
        .engine
        .enqueue(OperationDraft::create(items(), fields(json!({ "name": "A" }))))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), Some(OperationErrorKind::MissingContext));
    let recorded = device.engine.queue_snapshot().last_enqueue_error.unwrap();
    assert_eq!(recorded.kind, OperationErrorKind::MissingContext);
    assert!(backend.calls().is_empty());

    device.go_online().await;
    device
        .engine
        .enqueue(OperationDraft::create(items(), fields(json!({ "name": "A" }))))
        .await
        .unwrap();
    assert_eq!(device.engine.session().await.unwrap().unwrap().account_id, "acct");
    assert!(device.engine.queue_snapshot().last_enqueue_error.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn full_store_rejects_enqueue_without_side_effects() {
    let backend = Arc::new(InMemoryBackend::new());
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open_path(dir.path().join("full.db")).await.unwrap();
    let device = Device::new(&backend, store, false).await;
    // Clamped to the current size, so any growth fails.
    device.engine.store().set_max_page_count(1).await.unwrap();

    let error = device
        .engine
        .enqueue(OperationDraft::create(
            items(),
            fields(json!({ "name": "x".repeat(64 * 1024) })),
        ))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::StorageQuota(_)));
    assert!(device.engine.pending_operations().await.unwrap().is_empty());
    assert!(device.engine.list_entities("acct", None).await.unwrap().is_empty());
}
