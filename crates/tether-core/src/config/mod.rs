//! Engine configuration.
//!
//! `SyncConfig` is loaded from JSON. Every field has a default so a partial
//! file (or none at all) yields a working engine; unknown keys are rejected so
//! typos surface instead of silently falling back.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{EntityKind, Fields};
use crate::queue::RetryPolicy;
use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_HEALTH_PATH: &str = "/health";

/// Full engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
    /// Deadline for every remote call made while processing the queue
    pub request_timeout_ms: u64,
    pub scheduler: SchedulerConfig,
    pub network: NetworkConfig,
    pub background: BackgroundConfig,
    pub remote: RemoteConfig,
    /// Synced entities newer than this are refreshed during conflict scans
    pub recent_sync_window_ms: u64,
    /// Mutable-field allowlists, one per entity kind
    pub entities: Vec<EntitySchema>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout_ms: 10_000,
            scheduler: SchedulerConfig::default(),
            network: NetworkConfig::default(),
            background: BackgroundConfig::default(),
            remote: RemoteConfig::default(),
            recent_sync_window_ms: 5 * 60 * 1000,
            entities: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Load and validate a JSON config file
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json(&raw)
            .map_err(|error| Error::Config(format!("{}: {error}", path.display())))?;
        tracing::debug!(path = %path.display(), entities = config.entities.len(), "Loaded sync config");
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|error| Error::Config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if self.request_timeout_ms == 0 {
            return Err(Error::Config("request_timeout_ms must be positive".into()));
        }
        if self.scheduler.loop_threshold == 0 {
            return Err(Error::Config(
                "scheduler.loop_threshold must be at least 1".into(),
            ));
        }
        if self.network.probe_timeout_ms == 0 || self.network.poll_interval_ms == 0 {
            return Err(Error::Config(
                "network probe timeout and poll interval must be positive".into(),
            ));
        }
        if self.background.reply_timeout_ms == 0 {
            return Err(Error::Config(
                "background.reply_timeout_ms must be positive".into(),
            ));
        }
        self.remote.validate()?;

        let mut seen = Vec::with_capacity(self.entities.len());
        for schema in &self.entities {
            if seen.contains(&&schema.kind) {
                return Err(Error::Config(format!(
                    "entity kind '{}' is configured twice",
                    schema.kind
                )));
            }
            seen.push(&schema.kind);
            schema.validate()?;
        }
        Ok(())
    }

    pub fn schema_for(&self, kind: &EntityKind) -> Result<&EntitySchema> {
        self.entities
            .iter()
            .find(|schema| &schema.kind == kind)
            .ok_or_else(|| Error::Config(format!("no entity schema for kind '{kind}'")))
    }

    #[must_use]
    pub fn with_entity(mut self, schema: EntitySchema) -> Self {
        self.entities.retain(|existing| existing.kind != schema.kind);
        self.entities.push(schema);
        self
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub const fn recent_sync_window(&self) -> Duration {
        Duration::from_millis(self.recent_sync_window_ms)
    }
}

/// Scheduler pacing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    /// Minimum gap after a successful pass before automatic triggers run again
    pub cooldown_ms: u64,
    /// Identical pending counts across this many automatic attempts suspend triggering
    pub loop_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 2_000,
            loop_threshold: 8,
        }
    }
}

impl SchedulerConfig {
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Connectivity probing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NetworkConfig {
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Probes slower than this mark the connection slow
    pub slow_threshold_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            probe_timeout_ms: 3_000,
            slow_threshold_ms: 1_500,
        }
    }
}

impl NetworkConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub const fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }
}

/// Background-to-foreground flush relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackgroundConfig {
    /// Disabled coordinators ignore every signal
    pub enabled: bool,
    pub reply_timeout_ms: u64,
    /// Minimum gap between re-registrations with the platform
    pub reregister_cooldown_ms: u64,
    /// Re-registrations allowed without a successful flush in between
    pub max_reregistrations: u32,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reply_timeout_ms: 20_000,
            reregister_cooldown_ms: 60_000,
            max_reregistrations: 5,
        }
    }
}

impl BackgroundConfig {
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub const fn reregister_cooldown(&self) -> Duration {
        Duration::from_millis(self.reregister_cooldown_ms)
    }
}

/// Backend endpoints. Credentials are supplied at runtime, never stored here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    /// Same-origin health endpoint; defaults to `{base_url}/health`
    pub health_url: Option<String>,
    /// Authenticated fallback probe; defaults to `{base_url}/v1/session`
    pub auth_probe_url: Option<String>,
}

impl RemoteConfig {
    pub fn base_url(&self) -> Option<String> {
        normalize_text_option(self.base_url.clone())
            .map(|url| url.trim_end_matches('/').to_string())
    }

    pub fn health_url(&self) -> Option<String> {
        normalize_text_option(self.health_url.clone())
            .or_else(|| self.base_url().map(|base| format!("{base}{DEFAULT_HEALTH_PATH}")))
    }

    pub fn auth_probe_url(&self) -> Option<String> {
        normalize_text_option(self.auth_probe_url.clone())
            .or_else(|| self.base_url().map(|base| format!("{base}/v1/session")))
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("remote.base_url", self.base_url()),
            ("remote.health_url", normalize_text_option(self.health_url.clone())),
            ("remote.auth_probe_url", normalize_text_option(self.auth_probe_url.clone())),
        ] {
            if let Some(url) = value {
                if !is_http_url(&url) {
                    return Err(Error::Config(format!(
                        "{field} must include http:// or https://"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Mutable-field allowlist and wire naming for one entity kind
///
/// Server-managed columns (ids, versions, audit stamps) are never listed, so
/// they can neither be written by the client nor produce conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntitySchema {
    pub kind: EntityKind,
    pub mutable_fields: Vec<String>,
    /// Local field name to backend column name, where they differ
    #[serde(default)]
    pub remote_names: BTreeMap<String, String>,
}

impl EntitySchema {
    pub fn new<I, S>(kind: EntityKind, mutable_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            mutable_fields: mutable_fields.into_iter().map(Into::into).collect(),
            remote_names: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_remote_name(mut self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.remote_names.insert(local.into(), remote.into());
        self
    }

    pub fn is_mutable(&self, field: &str) -> bool {
        self.mutable_fields.iter().any(|name| name == field)
    }

    /// Reject payload keys outside the allowlist
    pub fn check_payload(&self, payload: &Fields) -> Result<()> {
        let unknown: Vec<&str> = payload
            .keys()
            .filter(|key| !self.is_mutable(key))
            .map(String::as_str)
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "fields not writable on '{}': {}",
                self.kind,
                unknown.join(", ")
            )))
        }
    }

    /// Keep only the mutable fields of `fields`
    pub fn mutable_subset(&self, fields: &Fields) -> Fields {
        fields
            .iter()
            .filter(|(key, _)| self.is_mutable(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Rename local field names to backend column names
    pub fn to_remote(&self, fields: &Fields) -> Fields {
        fields
            .iter()
            .map(|(key, value)| {
                let name = self.remote_names.get(key).unwrap_or(key);
                (name.clone(), value.clone())
            })
            .collect()
    }

    /// Rename backend column names to local field names
    pub fn from_remote(&self, fields: &Fields) -> Fields {
        fields
            .iter()
            .map(|(key, value)| {
                let name = self
                    .remote_names
                    .iter()
                    .find(|(_, remote)| *remote == key)
                    .map_or(key, |(local, _)| local);
                (name.clone(), value.clone())
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.mutable_fields.is_empty() {
            return Err(Error::Config(format!(
                "entity '{}' must list at least one mutable field",
                self.kind
            )));
        }
        for local in self.remote_names.keys() {
            if !self.is_mutable(local) {
                return Err(Error::Config(format!(
                    "entity '{}' renames '{local}', which is not a mutable field",
                    self.kind
                )));
            }
        }
        Ok(())
    }
}
