//! Connectivity detection.
//!
//! The device link state alone is never trusted: "up" only permits a probe,
//! and the probe decides. A probe that times out means offline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info};

use super::probe::{ConnectivityProbe, ProbeTarget};
use crate::clock::Clock;
use crate::config::NetworkConfig;
use crate::models::NetworkStatusSnapshot;
use crate::observe::{Publisher, Subscription};

pub struct NetworkStatusMonitor {
    probe: Arc<dyn ConnectivityProbe>,
    config: NetworkConfig,
    clock: Arc<dyn Clock>,
    link_up: AtomicBool,
    status: Publisher<NetworkStatusSnapshot>,
}

impl NetworkStatusMonitor {
    /// Starts offline until the first probe succeeds
    pub fn new(probe: Arc<dyn ConnectivityProbe>, config: NetworkConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            probe,
            config,
            clock,
            link_up: AtomicBool::new(true),
            status: Publisher::new(NetworkStatusSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> NetworkStatusSnapshot {
        self.status.current()
    }

    pub fn is_online(&self) -> bool {
        self.status.current().is_online
    }

    pub fn subscribe(&self, listener: impl Fn(&NetworkStatusSnapshot) + Send + Sync + 'static) -> Subscription {
        self.status.subscribe(listener)
    }

    pub fn watch(&self) -> watch::Receiver<NetworkStatusSnapshot> {
        self.status.watch()
    }

    /// Feed a device link-state change. Down is authoritative; up triggers a probe.
    pub async fn set_link_state(&self, up: bool) -> NetworkStatusSnapshot {
        let was_up = self.link_up.swap(up, Ordering::SeqCst);
        if up {
            if !was_up {
                debug!("Link came up, probing");
            }
            self.check_now().await
        } else {
            if was_up {
                info!("Link went down");
            }
            self.status.update(|status| {
                status.is_online = false;
                status.is_slow_connection = false;
                status.is_retrying = false;
            });
            self.snapshot()
        }
    }

    /// Probe now and publish the result
    pub async fn check_now(&self) -> NetworkStatusSnapshot {
        if !self.link_up.load(Ordering::SeqCst) {
            self.status.update(|status| {
                status.is_online = false;
                status.is_retrying = false;
            });
            return self.snapshot();
        }

        let was_online = self.is_online();
        if !was_online {
            self.status.update(|status| status.is_retrying = true);
        }

        let started = Instant::now();
        let reachable = self.probe_with_fallback().await;
        let elapsed = started.elapsed();
        // The link may have dropped while the probe was in flight.
        let online = reachable && self.link_up.load(Ordering::SeqCst);
        let now = self.clock.now_millis();

        self.status.update(|status| {
            status.is_online = online;
            status.is_retrying = false;
            status.is_slow_connection = online && elapsed > self.config.slow_threshold();
            if online {
                status.last_online_at = Some(now);
            }
        });

        if online != was_online {
            info!(online, latency_ms = crate::util::duration_millis(elapsed), "Connectivity changed");
        }
        self.snapshot()
    }

    async fn probe_with_fallback(&self) -> bool {
        for target in [ProbeTarget::Health, ProbeTarget::Authenticated] {
            match tokio::time::timeout(self.config.probe_timeout(), self.probe.check(target)).await {
                Ok(Ok(())) => return true,
                Ok(Err(error)) => debug!(?target, %error, "Probe failed"),
                Err(_) => debug!(?target, "Probe timed out"),
            }
        }
        false
    }

    /// Poll on the configured interval until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_now().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Network monitor stopped");
                        return;
                    }
                }
            }
        }
    }
}
