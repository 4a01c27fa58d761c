//! Connectivity probes

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::remote::RemoteError;
use crate::util::normalize_text_option;

/// Which endpoint a probe should hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTarget {
    /// Lightweight same-origin health endpoint
    Health,
    /// Authenticated endpoint, tried when the health check fails
    Authenticated,
}

/// Issues a single reachability check
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self, target: ProbeTarget) -> std::result::Result<(), RemoteError>;
}

/// HTTP GET probe against the backend's health and session endpoints
#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    health_url: String,
    auth_url: Option<String>,
    token: Option<String>,
}

impl std::fmt::Debug for HttpProbe {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpProbe")
            .field("health_url", &self.health_url)
            .field("auth_url", &self.auth_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpProbe {
    pub fn new(health_url: impl Into<String>, auth_url: Option<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let health_url = normalize_text_option(Some(health_url.into()))
            .ok_or_else(|| Error::Config("health URL must not be empty".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(format!("failed to build probe client: {error}")))?;
        Ok(Self {
            client,
            health_url,
            auth_url: normalize_text_option(auth_url),
            token: normalize_text_option(token),
        })
    }

    /// Build from the configured endpoints
    pub fn from_config(remote: &RemoteConfig, token: Option<String>, timeout: Duration) -> Result<Self> {
        let health_url = remote
            .health_url()
            .ok_or_else(|| Error::Config("remote.base_url or remote.health_url is required".to_string()))?;
        Self::new(health_url, remote.auth_probe_url(), token, timeout)
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self, target: ProbeTarget) -> std::result::Result<(), RemoteError> {
        let request = match target {
            ProbeTarget::Health => self.client.get(&self.health_url),
            ProbeTarget::Authenticated => {
                let (Some(url), Some(token)) = (&self.auth_url, &self.token) else {
                    return Err(RemoteError::Unauthorized(401));
                };
                self.client.get(url).bearer_auth(token)
            }
        };

        let response = request
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    RemoteError::Timeout(Duration::ZERO)
                } else {
                    RemoteError::Network(error.to_string())
                }
            })?;

        // Any answer from the server proves reachability except gateway failures.
        let status = response.status();
        if status.is_server_error() {
            Err(RemoteError::Server {
                status: status.as_u16(),
                message: format!("probe returned HTTP {}", status.as_u16()),
            })
        } else {
            Ok(())
        }
    }
}

/// Probe with a switchable answer, for tests and offline development
#[derive(Debug)]
pub struct StaticProbe {
    health: AtomicBool,
    authenticated: AtomicBool,
    delay: std::sync::Mutex<Duration>,
}

impl StaticProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            health: AtomicBool::new(reachable),
            authenticated: AtomicBool::new(reachable),
            delay: std::sync::Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.health.store(reachable, Ordering::SeqCst);
        self.authenticated.store(reachable, Ordering::SeqCst);
    }

    /// Fail the health endpoint only, leaving the authenticated fallback alone
    pub fn set_health_reachable(&self, reachable: bool) {
        self.health.store(reachable, Ordering::SeqCst);
    }

    /// Sleep this long before answering
    pub fn set_delay(&self, delay: Duration) {
        *self
            .delay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = delay;
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn check(&self, target: ProbeTarget) -> std::result::Result<(), RemoteError> {
        let delay = *self
            .delay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let reachable = match target {
            ProbeTarget::Health => self.health.load(Ordering::SeqCst),
            ProbeTarget::Authenticated => self.authenticated.load(Ordering::SeqCst),
        };
        if reachable {
            Ok(())
        } else {
            Err(RemoteError::Network("probe target unreachable".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_requires_an_endpoint() {
        let remote = RemoteConfig::default();
        assert!(HttpProbe::from_config(&remote, None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn from_config_derives_health_url() {
        let remote = RemoteConfig {
            base_url: Some("https://api.example.com".into()),
            ..RemoteConfig::default()
        };
        let probe = HttpProbe::from_config(&remote, Some("t".into()), Duration::from_secs(1)).unwrap();
        assert_eq!(probe.health_url, "https://api.example.com/health");
        assert_eq!(probe.auth_url.as_deref(), Some("https://api.example.com/v1/session"));
        assert!(!format!("{probe:?}").contains("\"t\""));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn static_probe_targets_are_independent() {
        let probe = StaticProbe::new(true);
        probe.set_health_reachable(false);
        assert!(probe.check(ProbeTarget::Health).await.is_err());
        assert!(probe.check(ProbeTarget::Authenticated).await.is_ok());
    }
}
