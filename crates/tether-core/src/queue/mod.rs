//! Durable mutation queue.
//!
//! Operations run strictly in `seq` order, one at a time, and only while the
//! network monitor reports online. A transient failure stops the pass so a
//! later operation can never overtake an earlier one.

mod retry;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use retry::RetryPolicy;

use crate::clock::Clock;
use crate::config::{EntitySchema, SyncConfig};
use crate::conflict::{ConflictDetector, Detection};
use crate::error::{Error, OperationErrorKind, RecordedError, Result};
use crate::models::{
    EntityId, FailedOperation, FailureReason, Identity, Operation, OperationDraft, OperationId,
    OperationType, QueueSnapshot, SessionContext,
};
use crate::network::NetworkStatusMonitor;
use crate::observe::{Publisher, Subscription};
use crate::remote::{CreateRequest, DeleteRequest, RemoteBackend, RemoteError, UpdateRequest};
use crate::services::{Completion, LocalStore};
use crate::util::duration_millis;

/// Why a processing pass ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    /// Every runnable operation was handled
    Drained,
    /// Nothing to do
    Empty,
    Offline,
    /// Another pass holds the processing latch
    AlreadyRunning,
    /// The head operation is backing off until `until` (Unix ms)
    Waiting { until: i64 },
    /// The head operation hit a transient failure
    Stalled { error: RecordedError },
}

/// Summary of one [`OperationQueue::process_queue`] pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub outcome: PassOutcome,
    pub succeeded: usize,
    pub failed: Vec<(OperationId, FailureReason)>,
    /// Entities whose operations were turned into conflict records
    pub conflicts: Vec<EntityId>,
    /// Operations still queued after the pass
    pub remaining: usize,
}

impl ProcessReport {
    const fn new(outcome: PassOutcome) -> Self {
        Self {
            outcome,
            succeeded: 0,
            failed: Vec::new(),
            conflicts: Vec::new(),
            remaining: 0,
        }
    }

    /// Whether the queue moved at all
    pub fn made_progress(&self) -> bool {
        self.succeeded > 0 || !self.failed.is_empty() || !self.conflicts.is_empty()
    }
}

/// What to do after handling the head operation
enum Step {
    Next,
    Stop(PassOutcome),
}

/// Clears the processing latch when the pass ends, however it ends
struct ProcessingGuard<'a> {
    latch: &'a AtomicBool,
    snapshot: &'a Publisher<QueueSnapshot>,
}

impl<'a> ProcessingGuard<'a> {
    fn acquire(latch: &'a AtomicBool, snapshot: &'a Publisher<QueueSnapshot>) -> Option<Self> {
        latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        snapshot.update(|snapshot| snapshot.is_processing = true);
        Some(Self { latch, snapshot })
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.latch.store(false, Ordering::Release);
        self.snapshot.update(|snapshot| snapshot.is_processing = false);
    }
}

pub struct OperationQueue {
    store: LocalStore,
    backend: Arc<dyn RemoteBackend>,
    monitor: Arc<NetworkStatusMonitor>,
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
    detector: ConflictDetector,
    processing: AtomicBool,
    snapshot: Publisher<QueueSnapshot>,
}

impl OperationQueue {
    pub fn new(
        store: LocalStore,
        backend: Arc<dyn RemoteBackend>,
        monitor: Arc<NetworkStatusMonitor>,
        config: Arc<SyncConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let detector = ConflictDetector::new(
            store.clone(),
            Arc::clone(&backend),
            Arc::clone(&config),
            Arc::clone(&clock),
        );
        Self {
            store,
            backend,
            monitor,
            config,
            clock,
            detector,
            processing: AtomicBool::new(false),
            snapshot: Publisher::new(QueueSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshot.current()
    }

    pub fn subscribe(&self, listener: impl Fn(&QueueSnapshot) + Send + Sync + 'static) -> Subscription {
        self.snapshot.subscribe(listener)
    }

    pub fn watch(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot.watch()
    }

    pub fn set_background_sync_available(&self, available: bool) {
        self.snapshot
            .update(|snapshot| snapshot.background_sync_available = available);
    }

    /// Reload the persisted counts into the snapshot
    pub async fn refresh_snapshot(&self) -> Result<QueueSnapshot> {
        let (length, failed_count, next_retry_at) = self.store.queue_counts().await?;
        self.snapshot.update(|snapshot| {
            snapshot.length = length;
            snapshot.failed_count = failed_count;
            snapshot.next_retry_at = next_retry_at;
        });
        Ok(self.snapshot())
    }

    /// Durably queue a mutation and apply it optimistically to the cache.
    ///
    /// Failures are also recorded as `last_enqueue_error` on the snapshot.
    pub async fn enqueue(&self, draft: OperationDraft) -> Result<OperationId> {
        let now = self.clock.now_millis();
        match self.try_enqueue(draft, now).await {
            Ok(operation) => {
                self.snapshot.update(|snapshot| {
                    snapshot.last_enqueue_at = Some(now);
                    snapshot.last_enqueue_error = None;
                });
                self.refresh_snapshot().await?;
                info!(
                    operation_id = %operation.id,
                    op_type = %operation.op_type,
                    kind = %operation.kind,
                    entity_id = %operation.entity_id,
                    seq = operation.seq,
                    "Enqueued operation"
                );
                Ok(operation.id)
            }
            Err(error) => {
                warn!(%error, "Enqueue failed");
                let recorded = RecordedError::from_error(&error, OperationErrorKind::PermanentValidation, now);
                self.snapshot
                    .update(|snapshot| snapshot.last_enqueue_error = Some(recorded));
                Err(error)
            }
        }
    }

    async fn try_enqueue(&self, draft: OperationDraft, now: i64) -> Result<Operation> {
        let schema = self.config.schema_for(&draft.kind)?;
        schema.check_payload(&draft.payload)?;

        let entity_id = match (draft.op_type, draft.entity_id) {
            (OperationType::Create, None) => EntityId::optimistic(),
            (OperationType::Create, Some(id)) if id.is_optimistic() => id,
            (OperationType::Create, Some(id)) => {
                return Err(Error::InvalidInput(format!(
                    "create must use an optimistic id, got '{id}'"
                )))
            }
            (_, Some(id)) => id,
            (op_type, None) => {
                return Err(Error::InvalidInput(format!("{op_type} requires an entity id")))
            }
        };
        if draft.op_type == OperationType::Update && draft.payload.is_empty() {
            return Err(Error::InvalidInput("update has no fields to change".into()));
        }

        let identity = self
            .resolve_identity(draft.account_id, draft.user_id, now)
            .await?;

        let operation = Operation {
            id: OperationId::new(),
            seq: 0,
            op_type: draft.op_type,
            kind: draft.kind,
            entity_id,
            parent_id: draft.parent_id,
            payload: draft.payload,
            baseline: crate::models::Fields::new(),
            account_id: identity.account_id,
            user_id: identity.user_id,
            base_version: None,
            base_timestamp: None,
            enqueued_at: now,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
        };
        self.store.enqueue(operation).await
    }

    /// Draft identity, then the cached session, then (online only) the backend
    async fn resolve_identity(&self, account_id: Option<String>, user_id: Option<String>, now: i64) -> Result<Identity> {
        if let (Some(account_id), Some(user_id)) = (&account_id, &user_id) {
            return Ok(Identity::new(account_id.clone(), user_id.clone()));
        }
        if let Some(session) = self.store.session().await? {
            return Ok(Identity::new(
                account_id.unwrap_or(session.account_id),
                user_id.unwrap_or(session.user_id),
            ));
        }
        if !self.monitor.is_online() {
            return Err(Error::MissingContext(
                "no cached session and the device is offline".into(),
            ));
        }

        let timeout = self.config.request_timeout();
        let identity = tokio::time::timeout(timeout, self.backend.current_identity())
            .await
            .unwrap_or(Err(RemoteError::Timeout(timeout)))
            .map_err(|error| Error::MissingContext(format!("could not resolve the current session: {error}")))?;
        self.store
            .set_session(&SessionContext {
                account_id: identity.account_id.clone(),
                user_id: identity.user_id.clone(),
                cached_at: now,
            })
            .await?;
        info!(account_id = %identity.account_id, "Cached session identity");
        Ok(Identity::new(
            account_id.unwrap_or(identity.account_id),
            user_id.unwrap_or(identity.user_id),
        ))
    }

    /// Replay queued operations against the backend until drained or blocked
    pub async fn process_queue(&self) -> Result<ProcessReport> {
        if !self.monitor.is_online() {
            return Ok(ProcessReport::new(PassOutcome::Offline));
        }
        let Some(_guard) = ProcessingGuard::acquire(&self.processing, &self.snapshot) else {
            debug!("Queue pass already running");
            return Ok(ProcessReport::new(PassOutcome::AlreadyRunning));
        };

        let mut report = ProcessReport::new(PassOutcome::Drained);
        let mut rebased = HashSet::new();
        let mut attempted = false;

        let outcome = loop {
            if !self.monitor.is_online() {
                break PassOutcome::Offline;
            }
            let Some(operation) = self.store.head().await? else {
                break if attempted {
                    PassOutcome::Drained
                } else {
                    PassOutcome::Empty
                };
            };
            let now = self.clock.now_millis();
            if let Some(until) = operation.next_attempt_at.filter(|_| operation.is_waiting(now)) {
                break PassOutcome::Waiting { until };
            }
            attempted = true;
            match self.process_one(operation, &mut rebased, &mut report).await? {
                Step::Next => {}
                Step::Stop(outcome) => break outcome,
            }
        };

        report.outcome = outcome;
        report.remaining = self.refresh_snapshot().await?.length;
        info!(
            outcome = ?report.outcome,
            succeeded = report.succeeded,
            failed = report.failed.len(),
            conflicts = report.conflicts.len(),
            remaining = report.remaining,
            "Queue pass finished"
        );
        Ok(report)
    }

    async fn process_one(
        &self,
        operation: Operation,
        rebased: &mut HashSet<OperationId>,
        report: &mut ProcessReport,
    ) -> Result<Step> {
        let schema = match self.config.schema_for(&operation.kind) {
            Ok(schema) => schema,
            Err(error) => {
                self.dead_letter(&operation, FailureReason::PermanentValidation, error.to_string(), report)
                    .await?;
                return Ok(Step::Next);
            }
        };

        // FIFO guarantees any earlier create has run; an optimistic id that is
        // still unresolved belongs to a create that failed or was cancelled.
        if let Some(missing) = operation.unresolved_references().first() {
            let message = format!("depends on {missing}, which was never created");
            self.dead_letter(&operation, FailureReason::DependencyFailed, message, report)
                .await?;
            return Ok(Step::Next);
        }

        debug!(
            operation_id = %operation.id,
            op_type = %operation.op_type,
            entity_id = %operation.entity_id,
            attempt = operation.retry_count + 1,
            "Executing operation"
        );

        match self.execute(&operation, schema).await {
            Ok(completion) => {
                self.complete(&operation, completion, report).await?;
                Ok(Step::Next)
            }
            Err(RemoteError::Conflict { .. }) if operation.op_type == OperationType::Create => {
                self.dead_letter(
                    &operation,
                    FailureReason::PermanentValidation,
                    "the server reported a version conflict for a new entity",
                    report,
                )
                .await?;
                Ok(Step::Next)
            }
            Err(RemoteError::Conflict { .. }) | Err(RemoteError::NotFound)
                if operation.op_type != OperationType::Create =>
            {
                self.reconcile(operation, rebased, report).await
            }
            Err(error) if error.is_transient() => self.retry_later(&operation, &error, report).await,
            Err(error) => {
                self.dead_letter(&operation, FailureReason::PermanentValidation, error.to_string(), report)
                    .await?;
                Ok(Step::Next)
            }
        }
    }

    /// Send one operation to the backend under the request timeout
    async fn execute(&self, operation: &Operation, schema: &EntitySchema) -> std::result::Result<Completion, RemoteError> {
        let timeout = self.config.request_timeout();
        tokio::time::timeout(timeout, self.send(operation, schema))
            .await
            .unwrap_or(Err(RemoteError::Timeout(timeout)))
    }

    async fn send(&self, operation: &Operation, schema: &EntitySchema) -> std::result::Result<Completion, RemoteError> {
        match operation.op_type {
            OperationType::Create => {
                let request = CreateRequest {
                    idempotency_key: operation.entity_id.to_string(),
                    scope_id: operation.account_id.clone(),
                    parent_id: operation.parent_id.clone(),
                    fields: schema.to_remote(&operation.payload),
                    updated_by: operation.user_id.clone(),
                };
                let record = self.backend.create(&operation.kind, request).await?;
                Ok(Completion::Stored(record.localized(schema)))
            }
            OperationType::Update => {
                let request = UpdateRequest {
                    fields: schema.to_remote(&operation.payload),
                    version: operation.base_version,
                    updated_by: operation.user_id.clone(),
                };
                let record = self
                    .backend
                    .update(&operation.kind, &operation.entity_id, request)
                    .await?;
                Ok(Completion::Stored(record.localized(schema)))
            }
            OperationType::Delete => {
                let request = DeleteRequest {
                    version: operation.base_version,
                    updated_by: operation.user_id.clone(),
                };
                match self
                    .backend
                    .delete(&operation.kind, &operation.entity_id, request)
                    .await
                {
                    // Already gone: a replayed delete whose first attempt committed.
                    Ok(()) | Err(RemoteError::NotFound) => Ok(Completion::Deleted),
                    Err(error) => Err(error),
                }
            }
        }
    }

    /// Decide what a version conflict (or a missing row) really means
    async fn reconcile(
        &self,
        operation: Operation,
        rebased: &mut HashSet<OperationId>,
        report: &mut ProcessReport,
    ) -> Result<Step> {
        let detection = match self.detector.detect_for_operation(&operation).await {
            Ok(detection) => detection,
            Err(Error::Remote(error)) if error.is_transient() => {
                return self.retry_later(&operation, &error, report).await;
            }
            Err(error) => return Err(error),
        };

        match detection {
            Detection::Conflict(record) => {
                let record = self.store.route_to_conflict(&operation, record).await?;
                warn!(
                    operation_id = %operation.id,
                    entity_id = %record.item_id,
                    conflict_type = %record.conflict_type,
                    fields = ?record.fields,
                    "Operation routed to conflict"
                );
                report.conflicts.push(record.item_id);
                Ok(Step::Next)
            }
            Detection::FalsePositive {
                server,
                already_applied: true,
            } => {
                debug!(operation_id = %operation.id, "Server already holds the change");
                self.complete(&operation, Completion::Stored(server), report)
                    .await?;
                Ok(Step::Next)
            }
            Detection::FalsePositive { server, .. } => {
                if rebased.insert(operation.id) {
                    debug!(
                        operation_id = %operation.id,
                        version = server.version,
                        "Rebasing operation onto server version"
                    );
                    self.store
                        .rebase(&operation.id, server.version, server.updated_at)
                        .await?;
                    Ok(Step::Next)
                } else {
                    let error = RemoteError::Conflict {
                        server_version: Some(server.version),
                    };
                    self.retry_later(&operation, &error, report).await
                }
            }
            Detection::Missing => {
                self.complete(&operation, Completion::Deleted, report).await?;
                Ok(Step::Next)
            }
        }
    }

    async fn complete(&self, operation: &Operation, completion: Completion, report: &mut ProcessReport) -> Result<()> {
        let now = self.clock.now_millis();
        self.store
            .complete_operation(operation, completion, now)
            .await?;
        report.succeeded += 1;
        debug!(operation_id = %operation.id, "Operation confirmed");
        Ok(())
    }

    /// Back off a transient failure, or dead-letter it once retries run out
    async fn retry_later(
        &self,
        operation: &Operation,
        error: &RemoteError,
        report: &mut ProcessReport,
    ) -> Result<Step> {
        let now = self.clock.now_millis();
        let recorded = RecordedError::new(error.kind(), error.to_string(), now);
        let retry_count = operation.retry_count + 1;
        let policy = &self.config.retry;

        if !policy.allows_retry(retry_count) {
            warn!(
                operation_id = %operation.id,
                retry_count,
                %error,
                "Retries exhausted, moving operation to failed"
            );
            self.store
                .fail_operation(operation, FailureReason::MaxRetriesExceeded, error.to_string(), now)
                .await?;
            report
                .failed
                .push((operation.id, FailureReason::MaxRetriesExceeded));
            return Ok(Step::Next);
        }

        let next_attempt_at = now + duration_millis(policy.delay_for(retry_count));
        warn!(
            operation_id = %operation.id,
            retry_count,
            next_attempt_at,
            %error,
            "Operation failed, will retry"
        );
        self.store
            .record_retry(&operation.id, retry_count, &recorded, Some(next_attempt_at))
            .await?;
        Ok(Step::Stop(PassOutcome::Stalled { error: recorded }))
    }

    async fn dead_letter(
        &self,
        operation: &Operation,
        reason: FailureReason,
        message: impl Into<String>,
        report: &mut ProcessReport,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        let failed = self
            .store
            .fail_operation(operation, reason, message, now)
            .await?;
        warn!(
            operation_id = %operation.id,
            reason = %failed.reason,
            message = %failed.message,
            "Operation failed permanently"
        );
        report.failed.push((operation.id, reason));
        Ok(())
    }

    pub async fn pending_operations(&self) -> Result<Vec<Operation>> {
        self.store.pending_operations().await
    }

    pub async fn failed_operations(&self) -> Result<Vec<FailedOperation>> {
        self.store.failed_operations().await
    }

    /// Drop a dead-letter record once the user has seen it
    pub async fn acknowledge_failure(&self, id: &OperationId) -> Result<bool> {
        let removed = self.store.acknowledge_failure(id).await?;
        self.refresh_snapshot().await?;
        Ok(removed)
    }

    /// Remove a pending operation and revert its optimistic change.
    ///
    /// Fails while a pass is running so an in-flight operation is never pulled
    /// out from under it.
    pub async fn cancel(&self, id: &OperationId) -> Result<bool> {
        if self.processing.load(Ordering::Acquire) {
            return Err(Error::InvalidInput(
                "cannot cancel while the queue is being processed".into(),
            ));
        }
        let cancelled = self
            .store
            .cancel_operation(id, self.clock.now_millis())
            .await?;
        self.refresh_snapshot().await?;
        if let Some(operation) = &cancelled {
            info!(operation_id = %operation.id, "Cancelled operation");
        }
        Ok(cancelled.is_some())
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub const fn detector(&self) -> &ConflictDetector {
        &self.detector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::NetworkConfig;
    use crate::models::{EntityKind, Fields};
    use crate::network::StaticProbe;
    use crate::remote::{Fault, InMemoryBackend, RemoteCall};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn kind() -> EntityKind {
        EntityKind::new("items").unwrap()
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    struct Harness {
        queue: OperationQueue,
        backend: Arc<InMemoryBackend>,
        probe: Arc<StaticProbe>,
        monitor: Arc<NetworkStatusMonitor>,
        clock: Arc<ManualClock>,
    }

    async fn harness() -> Harness {
        let store = LocalStore::open_in_memory().await.unwrap();
        let backend = Arc::new(InMemoryBackend::new().with_identity(Identity::new("acct", "me")));
        let probe = Arc::new(StaticProbe::new(true));
        let clock = Arc::new(ManualClock::new(1_000));
        let monitor = Arc::new(NetworkStatusMonitor::new(
            probe.clone(),
            NetworkConfig::default(),
            clock.clone(),
        ));
        monitor.check_now().await;
        let config = SyncConfig::default().with_entity(EntitySchema::new(kind(), ["name", "price"]));
        let queue = OperationQueue::new(store, backend.clone(), monitor.clone(), Arc::new(config), clock.clone());
        Harness {
            queue,
            backend,
            probe,
            monitor,
            clock,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_enqueue_without_session_is_missing_context() {
        let h = harness().await;
        h.probe.set_reachable(false);
        h.monitor.check_now().await;

        let error = h
            .queue
            .enqueue(OperationDraft::create(kind(), fields(json!({"name": "Lamp"}))))
            .await
            .unwrap_err();

        assert!(matches!(error, Error::MissingContext(_)));
        assert!(h.backend.calls().is_empty());
        let snapshot = h.queue.snapshot();
        assert_eq!(snapshot.length, 0);
        assert_eq!(
            snapshot.last_enqueue_error.map(|error| error.kind),
            Some(OperationErrorKind::MissingContext)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn online_enqueue_caches_identity_once() {
        let h = harness().await;
        for name in ["A", "B"] {
            h.queue
                .enqueue(OperationDraft::create(kind(), fields(json!({"name": name}))))
                .await
                .unwrap();
        }
        let identity_calls = h
            .backend
            .calls()
            .into_iter()
            .filter(|call| *call == RemoteCall::Identity)
            .count();
        assert_eq!(identity_calls, 1);
        assert_eq!(h.queue.snapshot().length, 2);
        assert!(h.queue.store().session().await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn payload_outside_allowlist_is_rejected() {
        let h = harness().await;
        let error = h
            .queue
            .enqueue(OperationDraft::create(kind(), fields(json!({"version": 3}))).with_identity("acct", "me"))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
        assert_eq!(h.queue.snapshot().length, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn process_is_a_noop_offline_or_empty() {
        let h = harness().await;
        assert_eq!(h.queue.process_queue().await.unwrap().outcome, PassOutcome::Empty);

        h.queue
            .enqueue(OperationDraft::create(kind(), fields(json!({"name": "Lamp"}))).with_identity("acct", "me"))
            .await
            .unwrap();
        h.monitor.set_link_state(false).await;
        assert_eq!(h.queue.process_queue().await.unwrap().outcome, PassOutcome::Offline);
        assert!(h.backend.writes().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failure_backs_off_and_stops_the_pass() {
        let h = harness().await;
        for name in ["A", "B"] {
            h.queue
                .enqueue(OperationDraft::create(kind(), fields(json!({"name": name}))).with_identity("acct", "me"))
                .await
                .unwrap();
        }
        h.backend
            .push_fault(Fault::Fail(RemoteError::Network("reset".into())));

        let report = h.queue.process_queue().await.unwrap();
        assert!(matches!(report.outcome, PassOutcome::Stalled { .. }));
        assert_eq!(report.remaining, 2);
        assert_eq!(h.backend.writes().len(), 1);

        let head = h.queue.pending_operations().await.unwrap().remove(0);
        assert_eq!(head.retry_count, 1);
        assert_eq!(head.next_attempt_at, Some(2_000));
        assert_eq!(
            head.last_error.map(|error| error.kind),
            Some(OperationErrorKind::TransientNetwork)
        );

        assert_eq!(
            h.queue.process_queue().await.unwrap().outcome,
            PassOutcome::Waiting { until: 2_000 }
        );
        h.clock.set(2_000);
        let report = h.queue.process_queue().await.unwrap();
        assert_eq!(report.outcome, PassOutcome::Drained);
        assert_eq!(report.succeeded, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_retries_move_to_failed() {
        let h = harness().await;
        h.queue
            .enqueue(OperationDraft::create(kind(), fields(json!({"name": "A"}))).with_identity("acct", "me"))
            .await
            .unwrap();
        h.backend.set_unreachable(true);

        for _ in 0..=h.queue.config.retry.max_retries {
            h.queue.process_queue().await.unwrap();
            h.clock.advance(1_000_000);
        }

        assert_eq!(h.queue.snapshot().length, 0);
        let failed = h.queue.failed_operations().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, FailureReason::MaxRetriesExceeded);
        assert_eq!(h.queue.snapshot().failed_count, 1);

        assert!(h.queue.acknowledge_failure(&failed[0].operation.id).await.unwrap());
        assert_eq!(h.queue.snapshot().failed_count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_head_does_not_hold_back_the_rest() {
        let h = harness().await;
        let mut ids = Vec::new();
        for name in ["A", "B"] {
            let id = h
                .queue
                .enqueue(OperationDraft::create(kind(), fields(json!({"name": name}))).with_identity("acct", "me"))
                .await
                .unwrap();
            ids.push(id);
        }
        let attempts = h.queue.config.retry.max_retries + 1;
        for _ in 0..attempts {
            h.backend
                .push_fault(Fault::Fail(RemoteError::Network("reset".into())));
        }

        let mut last = None;
        for _ in 0..attempts {
            last = Some(h.queue.process_queue().await.unwrap());
            h.clock.advance(1_000_000);
        }

        let report = last.unwrap();
        assert_eq!(report.outcome, PassOutcome::Drained);
        assert_eq!(report.failed, vec![(ids[0], FailureReason::MaxRetriesExceeded)]);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(h.backend.records(&kind()).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_passes_return_already_running() {
        let h = harness().await;
        let _guard = ProcessingGuard::acquire(&h.queue.processing, &h.queue.snapshot).unwrap();
        assert!(h.queue.snapshot().is_processing);
        assert_eq!(
            h.queue.process_queue().await.unwrap().outcome,
            PassOutcome::AlreadyRunning
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_removes_scheduled_retry_and_reverts_cache() {
        let h = harness().await;
        let id = h
            .queue
            .enqueue(OperationDraft::create(kind(), fields(json!({"name": "A"}))).with_identity("acct", "me"))
            .await
            .unwrap();
        assert_eq!(h.queue.store().list_cached("acct", None).await.unwrap().len(), 1);

        assert!(h.queue.cancel(&id).await.unwrap());
        assert!(!h.queue.cancel(&id).await.unwrap());
        assert_eq!(h.queue.snapshot().length, 0);
        assert!(h.queue.store().list_cached("acct", None).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshot_listeners_observe_enqueue() {
        let h = harness().await;
        let lengths = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&lengths);
        let _subscription = h.queue.subscribe(move |snapshot| {
            seen.lock().unwrap().push(snapshot.length);
        });

        h.queue
            .enqueue(OperationDraft::create(kind(), fields(json!({"name": "A"}))).with_identity("acct", "me"))
            .await
            .unwrap();
        assert_eq!(lengths.lock().unwrap().last(), Some(&1));
    }
}
