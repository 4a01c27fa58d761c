//! Pure scheduling state machine.
//!
//! Decides whether a trigger may start a queue pass and what to wait for
//! afterwards. Time is passed in, so every transition is testable without
//! sleeping.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    /// Next automatic pass not before `at`
    Scheduled { at: Instant },
    Running,
    /// Quiet period after a successful pass
    Cooldown { until: Instant },
}

impl SchedulerState {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scheduled { .. } => "scheduled",
            Self::Running => "running",
            Self::Cooldown { .. } => "cooldown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Reconnect, queue change or timer
    Automatic,
    /// Explicit user request; clears suspension and skips waits
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    Empty,
    AlreadyRunning,
    /// Automatic triggering is suspended by the loop guard
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run,
    /// Try again at this instant
    Wait(Instant),
    Skip(SkipReason),
}

/// How a pass ended, as far as pacing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassResult {
    Succeeded,
    /// The head operation is backing off until the given instant
    Waiting(Instant),
    Failed,
    /// The pass did not really run (went offline, or another pass held the queue)
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct SchedulerMachine {
    state: SchedulerState,
    suspended: bool,
    consecutive_failures: u32,
    last_pending: Option<usize>,
    stagnant_runs: u32,
    policy: RetryPolicy,
    cooldown: Duration,
    loop_threshold: u32,
}

impl SchedulerMachine {
    pub fn new(config: &SchedulerConfig, policy: RetryPolicy) -> Self {
        Self {
            state: SchedulerState::Idle,
            suspended: false,
            consecutive_failures: 0,
            last_pending: None,
            stagnant_runs: 0,
            policy,
            cooldown: config.cooldown(),
            loop_threshold: config.loop_threshold.max(1),
        }
    }

    pub const fn state(&self) -> SchedulerState {
        self.state
    }

    pub const fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// When the current wait ends, if there is one
    pub const fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            SchedulerState::Scheduled { at } => Some(at),
            SchedulerState::Cooldown { until } => Some(until),
            SchedulerState::Idle | SchedulerState::Running => None,
        }
    }

    fn expire(&mut self, now: Instant) {
        match self.state {
            SchedulerState::Scheduled { at } if at <= now => self.state = SchedulerState::Idle,
            SchedulerState::Cooldown { until } if until <= now => self.state = SchedulerState::Idle,
            _ => {}
        }
    }

    /// Decide whether `trigger` starts a pass. A `Run` moves the machine to
    /// `Running`; report the pass with [`Self::on_pass_finished`].
    pub fn on_trigger(&mut self, trigger: Trigger, pending: usize, online: bool, now: Instant) -> Decision {
        self.expire(now);
        if self.state == SchedulerState::Running {
            return Decision::Skip(SkipReason::AlreadyRunning);
        }
        if trigger == Trigger::Manual {
            self.suspended = false;
            self.reset_loop_guard();
        }
        if pending == 0 {
            if matches!(self.state, SchedulerState::Scheduled { .. }) {
                self.state = SchedulerState::Idle;
            }
            return Decision::Skip(SkipReason::Empty);
        }
        if !online {
            return Decision::Skip(SkipReason::Offline);
        }

        if trigger == Trigger::Automatic {
            if self.suspended {
                return Decision::Skip(SkipReason::Suspended);
            }
            if let Some(deadline) = self.next_deadline() {
                return Decision::Wait(deadline);
            }
            if self.last_pending == Some(pending) {
                self.stagnant_runs += 1;
            } else {
                self.last_pending = Some(pending);
                self.stagnant_runs = 1;
            }
            if self.stagnant_runs > self.loop_threshold {
                self.suspended = true;
                tracing::warn!(
                    pending,
                    attempts = self.loop_threshold,
                    "Queue is not making progress, suspending automatic sync"
                );
                return Decision::Skip(SkipReason::Suspended);
            }
        }

        self.state = SchedulerState::Running;
        Decision::Run
    }

    /// Record the end of a pass started by [`Decision::Run`]
    pub fn on_pass_finished(&mut self, result: PassResult, made_progress: bool, now: Instant) {
        if made_progress {
            self.reset_loop_guard();
        }
        self.state = match result {
            PassResult::Succeeded => {
                self.consecutive_failures = 0;
                SchedulerState::Cooldown {
                    until: now + self.cooldown,
                }
            }
            PassResult::Waiting(at) => SchedulerState::Scheduled { at: at.max(now) },
            PassResult::Failed => {
                self.consecutive_failures += 1;
                SchedulerState::Scheduled {
                    at: now + self.policy.delay_for(self.consecutive_failures),
                }
            }
            PassResult::Interrupted => SchedulerState::Idle,
        };
    }

    /// Drop any scheduled retry
    pub fn cancel(&mut self) {
        if self.state != SchedulerState::Running {
            self.state = SchedulerState::Idle;
        }
    }

    fn reset_loop_guard(&mut self) {
        self.last_pending = None;
        self.stagnant_runs = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn machine(loop_threshold: u32) -> SchedulerMachine {
        SchedulerMachine::new(
            &SchedulerConfig {
                cooldown_ms: 1_000,
                loop_threshold,
            },
            RetryPolicy {
                base_delay_ms: 100,
                max_delay_ms: 800,
                max_retries: 5,
            },
        )
    }

    #[test]
    fn idle_runs_when_online_with_pending_work() {
        let mut machine = machine(3);
        let now = Instant::now();
        assert_eq!(machine.on_trigger(Trigger::Automatic, 0, true, now), Decision::Skip(SkipReason::Empty));
        assert_eq!(machine.on_trigger(Trigger::Automatic, 2, false, now), Decision::Skip(SkipReason::Offline));
        assert_eq!(machine.on_trigger(Trigger::Automatic, 2, true, now), Decision::Run);
        assert_eq!(machine.state(), SchedulerState::Running);
        assert_eq!(
            machine.on_trigger(Trigger::Manual, 2, true, now),
            Decision::Skip(SkipReason::AlreadyRunning)
        );
    }

    #[test]
    fn success_enters_cooldown_then_idle() {
        let mut machine = machine(3);
        let now = Instant::now();
        machine.on_trigger(Trigger::Automatic, 1, true, now);
        machine.on_pass_finished(PassResult::Succeeded, true, now);

        let until = now + Duration::from_millis(1_000);
        assert_eq!(machine.state(), SchedulerState::Cooldown { until });
        assert_eq!(machine.on_trigger(Trigger::Automatic, 1, true, now), Decision::Wait(until));
        assert_eq!(machine.on_trigger(Trigger::Automatic, 1, true, until), Decision::Run);
    }

    #[test]
    fn failure_backoff_is_monotonic_and_resets_on_success() {
        let mut machine = machine(100);
        let mut now = Instant::now();
        let mut delays = Vec::new();
        for _ in 0..6 {
            assert_eq!(machine.on_trigger(Trigger::Automatic, 1, true, now), Decision::Run);
            machine.on_pass_finished(PassResult::Failed, false, now);
            let at = machine.next_deadline().unwrap();
            delays.push(at - now);
            now = at;
        }
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(delays.last(), Some(&Duration::from_millis(800)));

        machine.on_trigger(Trigger::Automatic, 1, true, now);
        machine.on_pass_finished(PassResult::Succeeded, true, now);
        assert_eq!(machine.consecutive_failures(), 0);

        let later = now + Duration::from_secs(5);
        machine.on_trigger(Trigger::Automatic, 1, true, later);
        machine.on_pass_finished(PassResult::Failed, false, later);
        assert_eq!(machine.next_deadline(), Some(later + Duration::from_millis(100)));
    }

    #[test]
    fn loop_guard_suspends_until_manual_trigger() {
        let mut machine = machine(3);
        let mut now = Instant::now();
        for _ in 0..3 {
            assert_eq!(machine.on_trigger(Trigger::Automatic, 4, true, now), Decision::Run);
            machine.on_pass_finished(PassResult::Succeeded, false, now);
            now += Duration::from_secs(10);
        }
        assert_eq!(
            machine.on_trigger(Trigger::Automatic, 4, true, now),
            Decision::Skip(SkipReason::Suspended)
        );
        assert!(machine.is_suspended());
        assert_eq!(
            machine.on_trigger(Trigger::Automatic, 4, true, now + Duration::from_secs(60)),
            Decision::Skip(SkipReason::Suspended)
        );

        assert_eq!(machine.on_trigger(Trigger::Manual, 4, true, now), Decision::Run);
        assert!(!machine.is_suspended());
    }

    #[test]
    fn progress_resets_the_loop_guard() {
        let mut machine = machine(2);
        let mut now = Instant::now();
        for _ in 0..5 {
            assert_eq!(machine.on_trigger(Trigger::Automatic, 4, true, now), Decision::Run);
            machine.on_pass_finished(PassResult::Succeeded, true, now);
            now += Duration::from_secs(10);
        }
        assert!(!machine.is_suspended());
    }

    #[test]
    fn manual_trigger_skips_scheduled_wait_and_cancel_returns_to_idle() {
        let mut machine = machine(3);
        let now = Instant::now();
        machine.on_trigger(Trigger::Automatic, 1, true, now);
        machine.on_pass_finished(PassResult::Failed, false, now);
        assert!(matches!(machine.on_trigger(Trigger::Automatic, 1, true, now), Decision::Wait(_)));

        machine.cancel();
        assert_eq!(machine.state(), SchedulerState::Idle);

        machine.on_trigger(Trigger::Automatic, 1, true, now);
        machine.on_pass_finished(PassResult::Failed, false, now);
        assert_eq!(machine.on_trigger(Trigger::Manual, 1, true, now), Decision::Run);
    }
}
