//! Background side of the flush relay.
//!
//! A background context cannot run the queue itself, so when connectivity
//! comes back it asks every live foreground context to flush and waits for the
//! first matching answer. No answer (or a failed one) means the platform is
//! asked for another sync opportunity later.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::message::{Envelope, SyncMessage};
use crate::clock::Clock;
use crate::config::BackgroundConfig;
use crate::error::Result;
use crate::util::duration_millis;

/// Platform hook for requesting a future background sync
#[async_trait]
pub trait SyncRegistrar: Send + Sync {
    async fn register_sync(&self, tag: &str) -> Result<()>;
}

/// Registrar for platforms without background sync; only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRegistrar;

#[async_trait]
impl SyncRegistrar for NoopRegistrar {
    async fn register_sync(&self, tag: &str) -> Result<()> {
        debug!(tag, "Background sync registration is not available");
        Ok(())
    }
}

/// Tag under which the queue flush is registered
pub const SYNC_TAG: &str = "tether-queue-flush";

/// Result of one connectivity-restored signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    Disabled,
    NoForeground,
    Flushed,
    Failed {
        error: Option<String>,
        reregistered: bool,
    },
    TimedOut {
        reregistered: bool,
    },
}

/// Foreground end of the relay
#[derive(Debug)]
pub struct ForegroundPort {
    requests: broadcast::Receiver<Envelope>,
    replies: mpsc::UnboundedSender<Envelope>,
}

impl ForegroundPort {
    /// Next flush request, or `None` once the coordinator is gone
    pub async fn next_request(&mut self) -> Option<Envelope> {
        loop {
            match self.requests.recv().await {
                Ok(envelope) if envelope.body == SyncMessage::RequestQueueFlush => return Some(envelope),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Foreground missed flush requests");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn reply(&self, envelope: Envelope) -> bool {
        self.replies.send(envelope).is_ok()
    }
}

#[derive(Debug, Default)]
struct Registration {
    last_at: Option<i64>,
    consecutive: u32,
}

pub struct BackgroundSyncCoordinator {
    config: BackgroundConfig,
    registrar: Arc<dyn SyncRegistrar>,
    clock: Arc<dyn Clock>,
    requests: broadcast::Sender<Envelope>,
    reply_sender: mpsc::UnboundedSender<Envelope>,
    replies: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    registration: Mutex<Registration>,
}

impl BackgroundSyncCoordinator {
    pub fn new(config: BackgroundConfig, registrar: Arc<dyn SyncRegistrar>, clock: Arc<dyn Clock>) -> Self {
        let (requests, _) = broadcast::channel(16);
        let (reply_sender, replies) = mpsc::unbounded_channel();
        Self {
            config,
            registrar,
            clock,
            requests,
            reply_sender,
            replies: tokio::sync::Mutex::new(replies),
            registration: Mutex::new(Registration::default()),
        }
    }

    /// Coordinator for runtimes without background contexts; every signal is a no-op
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self::new(
            BackgroundConfig {
                enabled: false,
                ..BackgroundConfig::default()
            },
            Arc::new(NoopRegistrar),
            clock,
        )
    }

    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Attach a foreground context
    pub fn register_foreground(&self) -> ForegroundPort {
        ForegroundPort {
            requests: self.requests.subscribe(),
            replies: self.reply_sender.clone(),
        }
    }

    pub fn foreground_count(&self) -> usize {
        self.requests.receiver_count()
    }

    fn registration(&self) -> MutexGuard<'_, Registration> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle "connectivity restored, please sync" in the background context
    pub async fn on_connectivity_restored(&self) -> FlushOutcome {
        if !self.config.enabled {
            return FlushOutcome::Disabled;
        }
        let request = Envelope::flush_request(self.clock.now_millis());
        let correlation_id = request.correlation_id;
        let Ok(reached) = self.requests.send(request) else {
            debug!("No foreground context to flush the queue");
            return FlushOutcome::NoForeground;
        };
        debug!(%correlation_id, reached, "Requested queue flush");

        let mut replies = self.replies.lock().await;
        let answer = tokio::time::timeout(self.config.reply_timeout(), async {
            while let Some(reply) = replies.recv().await {
                if reply.correlation_id != correlation_id {
                    debug!(correlation_id = %reply.correlation_id, "Ignoring reply to another request");
                    continue;
                }
                if let SyncMessage::QueueFlushResult { success, error } = reply.body {
                    return Some((success, error));
                }
            }
            None
        })
        .await;
        drop(replies);

        match answer {
            Ok(Some((true, _))) => {
                self.registration().consecutive = 0;
                info!("Foreground flushed the queue");
                FlushOutcome::Flushed
            }
            Ok(Some((false, error))) => {
                warn!(error = error.as_deref().unwrap_or("unknown"), "Foreground flush failed");
                let reregistered = self.reregister().await;
                FlushOutcome::Failed { error, reregistered }
            }
            Ok(None) | Err(_) => {
                warn!("No flush result before the reply timeout");
                let reregistered = self.reregister().await;
                FlushOutcome::TimedOut { reregistered }
            }
        }
    }

    /// Ask the platform for another sync opportunity, unless paced out
    async fn reregister(&self) -> bool {
        let now = self.clock.now_millis();
        {
            let registration = self.registration();
            let cooldown = duration_millis(self.config.reregister_cooldown());
            if registration.last_at.is_some_and(|last| now - last < cooldown) {
                debug!("Re-registration skipped during cooldown");
                return false;
            }
            if registration.consecutive >= self.config.max_reregistrations {
                warn!(
                    attempts = registration.consecutive,
                    "Background flush keeps failing, not re-registering"
                );
                return false;
            }
        }

        match self.registrar.register_sync(SYNC_TAG).await {
            Ok(()) => {
                let mut registration = self.registration();
                registration.last_at = Some(now);
                registration.consecutive += 1;
                info!(tag = SYNC_TAG, "Re-registered background sync");
                true
            }
            Err(error) => {
                warn!(%error, "Background sync registration failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct CountingRegistrar {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SyncRegistrar for CountingRegistrar {
        async fn register_sync(&self, _tag: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn coordinator(registrar: Arc<CountingRegistrar>, clock: Arc<ManualClock>) -> BackgroundSyncCoordinator {
        BackgroundSyncCoordinator::new(
            BackgroundConfig {
                enabled: true,
                reply_timeout_ms: 50,
                reregister_cooldown_ms: 1_000,
                max_reregistrations: 2,
            },
            registrar,
            clock,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_coordinator_ignores_signals() {
        let coordinator = BackgroundSyncCoordinator::disabled(Arc::new(ManualClock::new(0)));
        let _port = coordinator.register_foreground();
        assert_eq!(coordinator.on_connectivity_restored().await, FlushOutcome::Disabled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn without_foreground_nothing_happens() {
        let registrar = Arc::new(CountingRegistrar::default());
        let coordinator = coordinator(registrar.clone(), Arc::new(ManualClock::new(0)));
        assert_eq!(coordinator.on_connectivity_restored().await, FlushOutcome::NoForeground);
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_matching_reply_wins_and_foreign_ids_are_ignored() {
        let registrar = Arc::new(CountingRegistrar::default());
        let coordinator = Arc::new(coordinator(registrar.clone(), Arc::new(ManualClock::new(0))));
        let mut port = coordinator.register_foreground();

        let responder = tokio::spawn(async move {
            let request = port.next_request().await.unwrap();
            let stranger = Envelope::flush_request(0).reply(false, Some("not yours".into()), 0);
            port.reply(stranger);
            port.reply(request.reply(true, None, 1));
            port
        });

        assert_eq!(coordinator.on_connectivity_restored().await, FlushOutcome::Flushed);
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 0);
        drop(responder.await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_reregisters_within_cooldown_and_loop_limits() {
        let registrar = Arc::new(CountingRegistrar::default());
        let clock = Arc::new(ManualClock::new(0));
        let coordinator = coordinator(registrar.clone(), clock.clone());
        let _silent = coordinator.register_foreground();

        let first = coordinator.on_connectivity_restored().await;
        assert_eq!(first, FlushOutcome::TimedOut { reregistered: true });

        // Inside the cooldown.
        let second = coordinator.on_connectivity_restored().await;
        assert_eq!(second, FlushOutcome::TimedOut { reregistered: false });

        clock.advance(2_000);
        assert_eq!(
            coordinator.on_connectivity_restored().await,
            FlushOutcome::TimedOut { reregistered: true }
        );

        // Loop limit reached.
        clock.advance(2_000);
        assert_eq!(
            coordinator.on_connectivity_restored().await,
            FlushOutcome::TimedOut { reregistered: false }
        );
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_flush_reports_error() {
        let registrar = Arc::new(CountingRegistrar::default());
        let coordinator = Arc::new(coordinator(registrar.clone(), Arc::new(ManualClock::new(0))));
        let mut port = coordinator.register_foreground();
        tokio::spawn(async move {
            if let Some(request) = port.next_request().await {
                port.reply(request.reply(false, Some("offline".into()), 1));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        assert_eq!(
            coordinator.on_connectivity_restored().await,
            FlushOutcome::Failed {
                error: Some("offline".into()),
                reregistered: true
            }
        );
    }
}
