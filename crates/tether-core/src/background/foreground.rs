//! Foreground side of the flush relay

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::coordinator::ForegroundPort;
use super::message::Envelope;
use crate::clock::Clock;
use crate::queue::{OperationQueue, PassOutcome};

/// Answers flush requests by running the local queue
pub struct ForegroundAgent {
    queue: Arc<OperationQueue>,
    clock: Arc<dyn Clock>,
    port: ForegroundPort,
}

impl ForegroundAgent {
    pub fn new(queue: Arc<OperationQueue>, clock: Arc<dyn Clock>, port: ForegroundPort) -> Self {
        Self { queue, clock, port }
    }

    /// Run the queue for `request` and build the reply
    pub async fn handle(&self, request: &Envelope) -> Envelope {
        let (success, error) = match self.queue.process_queue().await {
            Ok(report) => match report.outcome {
                // A concurrent pass is already flushing.
                PassOutcome::Drained | PassOutcome::Empty | PassOutcome::AlreadyRunning => (true, None),
                PassOutcome::Offline => (false, Some("device is offline".to_string())),
                PassOutcome::Waiting { until } => {
                    (false, Some(format!("next operation is backing off until {until}")))
                }
                PassOutcome::Stalled { error } => (false, Some(error.message)),
            },
            Err(error) => (false, Some(error.user_message())),
        };
        debug!(correlation_id = %request.correlation_id, success, "Answered flush request");
        request.reply(success, error, self.clock.now_millis())
    }

    /// Serve requests until shutdown or until the coordinator goes away
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Foreground flush agent started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                request = self.port.next_request() => {
                    let Some(request) = request else { break };
                    let reply = self.handle(&request).await;
                    if !self.port.reply(reply) {
                        warn!("Coordinator dropped before the flush result was delivered");
                        break;
                    }
                }
            }
        }
        info!("Foreground flush agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::{BackgroundSyncCoordinator, FlushOutcome, NoopRegistrar};
    use crate::clock::ManualClock;
    use crate::config::{BackgroundConfig, EntitySchema, NetworkConfig, SyncConfig};
    use crate::models::{EntityKind, Identity, OperationDraft};
    use crate::network::{NetworkStatusMonitor, StaticProbe};
    use crate::remote::InMemoryBackend;
    use crate::services::LocalStore;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn background_signal_flushes_the_foreground_queue() {
        let clock = Arc::new(ManualClock::new(1_000));
        let kind = EntityKind::new("items").unwrap();
        let backend = Arc::new(InMemoryBackend::new().with_identity(Identity::new("acct", "me")));
        let monitor = Arc::new(NetworkStatusMonitor::new(
            Arc::new(StaticProbe::new(true)),
            NetworkConfig::default(),
            clock.clone(),
        ));
        let config = Arc::new(SyncConfig::default().with_entity(EntitySchema::new(kind.clone(), ["name"])));
        let queue = Arc::new(OperationQueue::new(
            LocalStore::open_in_memory().await.unwrap(),
            backend.clone(),
            monitor.clone(),
            config,
            clock.clone(),
        ));
        queue
            .enqueue(
                OperationDraft::create(kind.clone(), json!({ "name": "A" }).as_object().cloned().unwrap())
                    .with_identity("acct", "me"),
            )
            .await
            .unwrap();
        monitor.check_now().await;

        let coordinator = BackgroundSyncCoordinator::new(
            BackgroundConfig {
                enabled: true,
                reply_timeout_ms: 2_000,
                ..BackgroundConfig::default()
            },
            Arc::new(NoopRegistrar),
            clock.clone(),
        );
        let agent = ForegroundAgent::new(queue.clone(), clock, coordinator.register_foreground());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(agent.run(shutdown_rx));

        assert_eq!(coordinator.on_connectivity_restored().await, FlushOutcome::Flushed);
        assert_eq!(queue.snapshot().length, 0);
        assert_eq!(backend.records(&kind).len(), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
