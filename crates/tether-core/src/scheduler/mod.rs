//! Sync scheduling.
//!
//! [`SchedulerMachine`] holds the pacing rules; [`SyncScheduler`] drives it
//! from network changes, queue changes, its own timer and manual requests.

mod machine;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

pub use machine::{Decision, PassResult, SchedulerMachine, SchedulerState, SkipReason, Trigger};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::network::NetworkStatusMonitor;
use crate::queue::{OperationQueue, PassOutcome, ProcessReport};

/// What a trigger led to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Ran { report: ProcessReport },
    Skipped { reason: SkipReason },
    /// Paced out by cooldown or backoff; the timer will retry
    Deferred,
}

/// Requests accepted by a running scheduler
#[derive(Debug)]
enum SchedulerCommand {
    SyncNow {
        reply: oneshot::Sender<Result<TriggerOutcome>>,
    },
    Cancel,
}

/// Cloneable handle for talking to a running [`SyncScheduler`]
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Ask the scheduler loop for a manual pass and wait for its outcome
    pub async fn request_sync(&self) -> Result<TriggerOutcome> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SchedulerCommand::SyncNow { reply })
            .map_err(|_| Error::NotRunning("scheduler loop has stopped".into()))?;
        response
            .await
            .map_err(|_| Error::NotRunning("scheduler loop dropped the request".into()))?
    }

    /// Drop any scheduled retry; returns false when the loop has stopped
    pub fn cancel(&self) -> bool {
        self.commands.send(SchedulerCommand::Cancel).is_ok()
    }
}

pub struct SyncScheduler {
    queue: Arc<OperationQueue>,
    monitor: Arc<NetworkStatusMonitor>,
    clock: Arc<dyn Clock>,
    machine: Mutex<SchedulerMachine>,
    commands: mpsc::UnboundedSender<SchedulerCommand>,
    command_receiver: Mutex<Option<mpsc::UnboundedReceiver<SchedulerCommand>>>,
}

impl SyncScheduler {
    pub fn new(
        queue: Arc<OperationQueue>,
        monitor: Arc<NetworkStatusMonitor>,
        config: &SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (commands, command_receiver) = mpsc::unbounded_channel();
        Self {
            queue,
            monitor,
            clock,
            machine: Mutex::new(SchedulerMachine::new(&config.scheduler, config.retry.clone())),
            commands,
            command_receiver: Mutex::new(Some(command_receiver)),
        }
    }

    fn machine(&self) -> MutexGuard<'_, SchedulerMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            commands: self.commands.clone(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.machine().state()
    }

    pub fn is_suspended(&self) -> bool {
        self.machine().is_suspended()
    }

    /// Drop any scheduled retry and return to idle
    pub fn cancel(&self) {
        self.machine().cancel();
        debug!("Scheduled sync cancelled");
    }

    /// Evaluate `trigger` and run a pass if the machine allows it
    pub async fn trigger(&self, trigger: Trigger) -> Result<TriggerOutcome> {
        let pending = self.queue.snapshot().length;
        let online = self.monitor.is_online();
        let decision = self
            .machine()
            .on_trigger(trigger, pending, online, Instant::now());

        match decision {
            Decision::Skip(reason) => {
                debug!(?trigger, ?reason, "Sync trigger skipped");
                Ok(TriggerOutcome::Skipped { reason })
            }
            Decision::Wait(_) => Ok(TriggerOutcome::Deferred),
            Decision::Run => {
                debug!(?trigger, pending, "Starting queue pass");
                let result = self.queue.process_queue().await;
                let (pass, progress) = match &result {
                    Ok(report) => (self.pass_result(&report.outcome), report.made_progress()),
                    Err(_) => (PassResult::Failed, false),
                };
                self.machine().on_pass_finished(pass, progress, Instant::now());
                result.map(|report| TriggerOutcome::Ran { report })
            }
        }
    }

    fn pass_result(&self, outcome: &PassOutcome) -> PassResult {
        match outcome {
            PassOutcome::Drained | PassOutcome::Empty => PassResult::Succeeded,
            PassOutcome::Waiting { until } => {
                let wait = u64::try_from(until - self.clock.now_millis()).unwrap_or(0);
                PassResult::Waiting(Instant::now() + Duration::from_millis(wait))
            }
            PassOutcome::Stalled { .. } => PassResult::Failed,
            PassOutcome::Offline | PassOutcome::AlreadyRunning => PassResult::Interrupted,
        }
    }

    /// Drive the machine until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let receiver = self
            .command_receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut commands) = receiver else {
            tracing::warn!("Scheduler loop already started");
            return;
        };
        let mut network = self.monitor.watch();
        let mut queue = self.queue.watch();
        info!("Sync scheduler started");

        self.automatic().await;
        loop {
            let deadline = self.machine().next_deadline();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = network.borrow_and_update().is_online;
                    if online {
                        self.automatic().await;
                    }
                }
                changed = queue.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let idle = !queue.borrow_and_update().is_processing;
                    if idle {
                        self.automatic().await;
                    }
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.automatic().await;
                }
                Some(command) = commands.recv() => match command {
                    SchedulerCommand::SyncNow { reply } => {
                        let outcome = self.trigger(Trigger::Manual).await;
                        let _ = reply.send(outcome);
                    }
                    SchedulerCommand::Cancel => self.cancel(),
                },
            }
        }
        info!("Sync scheduler stopped");
    }

    async fn automatic(&self) {
        if let Err(error) = self.trigger(Trigger::Automatic).await {
            tracing::warn!(%error, "Automatic sync pass failed");
        }
    }
}
