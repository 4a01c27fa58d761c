//! The sync engine service.
//!
//! One `SyncEngine` owns one of each component and is the surface UIs and the
//! CLI talk to. Nothing here is global: build as many engines as there are
//! stores.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::background::{BackgroundSyncCoordinator, FlushOutcome, ForegroundAgent, NoopRegistrar, SyncRegistrar};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::conflict::{ConflictDetector, ConflictResolver, ResolveReport};
use crate::error::{Error, OperationErrorKind, Result};
use crate::models::{
    CachedEntity, ConflictRecord, EntityId, EntityKind, FailedOperation, Identity, NetworkStatusSnapshot,
    Operation, OperationDraft, OperationId, QueueSnapshot, Resolution, SessionContext,
};
use crate::network::{ConnectivityProbe, HttpProbe, NetworkStatusMonitor};
use crate::observe::Subscription;
use crate::queue::{OperationQueue, ProcessReport};
use crate::remote::{HttpBackend, RemoteBackend};
use crate::scheduler::{SchedulerState, SyncScheduler, Trigger, TriggerOutcome};
use crate::services::LocalStore;

/// Point-in-time view of the whole engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub network: NetworkStatusSnapshot,
    pub queue: QueueSnapshot,
    pub scheduler: &'static str,
    pub scheduler_suspended: bool,
    pub conflicts: usize,
    pub running: bool,
}

enum Lifecycle {
    Idle,
    Running {
        shutdown: watch::Sender<bool>,
        tasks: Vec<JoinHandle<()>>,
    },
    Stopped,
}

/// Assembles a [`SyncEngine`] from its collaborators.
///
/// The backend and probe default to the HTTP implementations built from
/// `config.remote` when not supplied.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    store: Option<LocalStore>,
    backend: Option<Arc<dyn RemoteBackend>>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    registrar: Option<Arc<dyn SyncRegistrar>>,
    clock: Arc<dyn Clock>,
    token: Option<String>,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            store: None,
            backend: None,
            probe: None,
            registrar: None,
            clock: Arc::new(SystemClock),
            token: None,
        }
    }

    #[must_use]
    pub fn store(mut self, store: LocalStore) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    #[must_use]
    pub fn probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    #[must_use]
    pub fn registrar(mut self, registrar: Arc<dyn SyncRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bearer token for the default HTTP backend and probe
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn build(self) -> Result<SyncEngine> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| Error::Config("a local store is required".into()))?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => {
                let base_url = self.config.remote.base_url().ok_or_else(|| {
                    Error::Config("remote.base_url is required without a custom backend".into())
                })?;
                Arc::new(HttpBackend::new(
                    base_url,
                    self.token.clone(),
                    self.config.request_timeout(),
                )?)
            }
        };
        let probe = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HttpProbe::from_config(
                &self.config.remote,
                self.token,
                self.config.network.probe_timeout(),
            )?),
        };

        let clock = self.clock;
        let config = Arc::new(self.config);
        let monitor = Arc::new(NetworkStatusMonitor::new(
            probe,
            config.network.clone(),
            Arc::clone(&clock),
        ));
        let queue = Arc::new(OperationQueue::new(
            store.clone(),
            Arc::clone(&backend),
            Arc::clone(&monitor),
            Arc::clone(&config),
            Arc::clone(&clock),
        ));
        let resolver = ConflictResolver::new(
            store.clone(),
            backend,
            Arc::clone(&config),
            Arc::clone(&clock),
        );
        let scheduler = Arc::new(SyncScheduler::new(
            Arc::clone(&queue),
            Arc::clone(&monitor),
            &config,
            Arc::clone(&clock),
        ));
        let coordinator = Arc::new(if config.background.enabled {
            BackgroundSyncCoordinator::new(
                config.background.clone(),
                self.registrar.unwrap_or_else(|| Arc::new(NoopRegistrar)),
                Arc::clone(&clock),
            )
        } else {
            BackgroundSyncCoordinator::disabled(Arc::clone(&clock))
        });
        queue.set_background_sync_available(coordinator.is_enabled());

        Ok(SyncEngine {
            config,
            clock,
            store,
            monitor,
            queue,
            resolver,
            scheduler,
            coordinator,
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }
}

pub struct SyncEngine {
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
    store: LocalStore,
    monitor: Arc<NetworkStatusMonitor>,
    queue: Arc<OperationQueue>,
    resolver: ConflictResolver,
    scheduler: Arc<SyncScheduler>,
    coordinator: Arc<BackgroundSyncCoordinator>,
    lifecycle: Mutex<Lifecycle>,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running { .. })
    }

    /// Spawn the monitor, scheduler and foreground flush agent.
    ///
    /// An engine starts once; after [`Self::shutdown`] build a new one.
    pub async fn start(&self) -> Result<()> {
        self.queue.refresh_snapshot().await?;

        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Running { .. } => return Ok(()),
            Lifecycle::Stopped => return Err(Error::NotRunning("engine was shut down".into())),
            Lifecycle::Idle => {}
        }

        let (shutdown, receiver) = watch::channel(false);
        let mut tasks = vec![
            tokio::spawn(Arc::clone(&self.monitor).run(receiver.clone())),
            tokio::spawn(Arc::clone(&self.scheduler).run(receiver.clone())),
        ];
        if self.coordinator.is_enabled() {
            let agent = ForegroundAgent::new(
                Arc::clone(&self.queue),
                Arc::clone(&self.clock),
                self.coordinator.register_foreground(),
            );
            tasks.push(tokio::spawn(agent.run(receiver)));
        }
        *lifecycle = Lifecycle::Running { shutdown, tasks };
        info!(
            entities = self.config.entities.len(),
            background = self.coordinator.is_enabled(),
            "Sync engine started"
        );
        Ok(())
    }

    /// Stop every background task and wait for them to finish
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);
        let Lifecycle::Running { shutdown, tasks } = previous else {
            return;
        };
        let _ = shutdown.send(true);
        for task in tasks {
            if let Err(error) = task.await {
                warn!(%error, "Engine task ended abnormally");
            }
        }
        info!("Sync engine stopped");
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let queue = self.queue.refresh_snapshot().await?;
        Ok(EngineStatus {
            network: self.monitor.snapshot(),
            queue,
            scheduler: self.scheduler.state().label(),
            scheduler_suspended: self.scheduler.is_suspended(),
            conflicts: self.store.conflict_count().await?,
            running: self.is_running(),
        })
    }

    // Mutations and the queue

    pub async fn enqueue(&self, draft: OperationDraft) -> Result<OperationId> {
        self.queue.enqueue(draft).await
    }

    /// Run one pass directly, bypassing the scheduler's pacing
    pub async fn process_queue(&self) -> Result<ProcessReport> {
        self.queue.process_queue().await
    }

    /// Manual sync: clears loop suspension and runs a pass now
    pub async fn sync_now(&self) -> Result<TriggerOutcome> {
        if self.is_running() {
            self.scheduler.handle().request_sync().await
        } else {
            self.scheduler.trigger(Trigger::Manual).await
        }
    }

    /// Drop any scheduled retry pass
    pub fn cancel_scheduled_sync(&self) {
        if !(self.is_running() && self.scheduler.handle().cancel()) {
            self.scheduler.cancel();
        }
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub async fn pending_operations(&self) -> Result<Vec<Operation>> {
        self.queue.pending_operations().await
    }

    pub async fn failed_operations(&self) -> Result<Vec<FailedOperation>> {
        self.queue.failed_operations().await
    }

    pub async fn acknowledge_failure(&self, id: &OperationId) -> Result<bool> {
        self.queue.acknowledge_failure(id).await
    }

    pub async fn cancel_operation(&self, id: &OperationId) -> Result<bool> {
        self.queue.cancel(id).await
    }

    // Reads

    /// Cached copy, refreshed from the server when online and the entity has
    /// no local changes waiting.
    pub async fn get_entity(&self, kind: &EntityKind, id: &EntityId) -> Result<Option<CachedEntity>> {
        let cached = self.store.cached(id).await?;
        let dirty = cached.as_ref().is_some_and(CachedEntity::has_local_changes);
        if dirty || id.is_optimistic() || !self.monitor.is_online() {
            return Ok(cached);
        }

        match self.detector().fetch_server(kind, id).await {
            Ok(Some(record)) => {
                let now = self.clock.now_millis();
                Ok(Some(self.store.cache_remote(kind, record, now).await?))
            }
            Ok(None) => {
                self.store.evict_if_clean(id).await?;
                self.store.cached(id).await
            }
            Err(error) if error.kind().is_some_and(OperationErrorKind::is_retryable) => {
                debug!(entity_id = %id, %error, "Serving cached copy after failed fetch");
                Ok(cached)
            }
            Err(error) => Err(error),
        }
    }

    pub async fn list_entities(&self, scope_id: &str, kind: Option<&EntityKind>) -> Result<Vec<CachedEntity>> {
        self.store.list_cached(scope_id, kind).await
    }

    pub async fn list_children(&self, parent_id: &EntityId) -> Result<Vec<CachedEntity>> {
        self.store.list_children(parent_id).await
    }

    // Conflicts

    pub async fn detect_conflicts(&self, scope_id: &str) -> Result<Vec<ConflictRecord>> {
        let records = self.detector().detect_conflicts(scope_id).await?;
        self.queue.refresh_snapshot().await?;
        Ok(records)
    }

    pub async fn conflicts(&self, scope_id: Option<&str>) -> Result<Vec<ConflictRecord>> {
        self.store.conflicts(scope_id).await
    }

    pub async fn resolve(&self, item_id: &EntityId, resolution: Resolution) -> Result<()> {
        let conflict = self
            .store
            .conflict(item_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict for {item_id}")))?;
        self.resolver.apply_resolution(&conflict, resolution).await?;
        self.queue.refresh_snapshot().await?;
        Ok(())
    }

    pub async fn resolve_all(&self, default: Resolution) -> Result<ResolveReport> {
        let report = self.resolver.resolve_all(default).await?;
        self.queue.refresh_snapshot().await?;
        Ok(report)
    }

    // Connectivity and background coordination

    pub fn network_status(&self) -> NetworkStatusSnapshot {
        self.monitor.snapshot()
    }

    pub async fn check_connectivity(&self) -> NetworkStatusSnapshot {
        self.monitor.check_now().await
    }

    /// Feed the platform's link-state signal
    pub async fn set_link_state(&self, up: bool) -> NetworkStatusSnapshot {
        self.monitor.set_link_state(up).await
    }

    /// Entry point for the background context's "connectivity restored" event
    pub async fn on_background_connectivity_restored(&self) -> FlushOutcome {
        self.coordinator.on_connectivity_restored().await
    }

    pub fn coordinator(&self) -> &Arc<BackgroundSyncCoordinator> {
        &self.coordinator
    }

    // Observation

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    pub fn subscribe_queue(&self, listener: impl Fn(&QueueSnapshot) + Send + Sync + 'static) -> Subscription {
        self.queue.subscribe(listener)
    }

    pub fn subscribe_network(
        &self,
        listener: impl Fn(&NetworkStatusSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.monitor.subscribe(listener)
    }

    pub fn watch_queue(&self) -> watch::Receiver<QueueSnapshot> {
        self.queue.watch()
    }

    pub fn watch_network(&self) -> watch::Receiver<NetworkStatusSnapshot> {
        self.monitor.watch()
    }

    // Session

    pub async fn session(&self) -> Result<Option<SessionContext>> {
        self.store.session().await
    }

    pub async fn set_session(&self, identity: Identity) -> Result<()> {
        self.store
            .set_session(&SessionContext {
                account_id: identity.account_id,
                user_id: identity.user_id,
                cached_at: self.clock.now_millis(),
            })
            .await
    }

    pub async fn clear_session(&self) -> Result<()> {
        self.store.clear_session().await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    fn detector(&self) -> &ConflictDetector {
        self.queue.detector()
    }
}
