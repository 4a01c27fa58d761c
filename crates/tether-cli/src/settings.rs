//! Resolves where the store lives and how to reach the backend.
//!
//! Precedence for every value: command-line flag, then `TETHER_*` environment
//! variable (a `.env` file is loaded first), then the config file, then the
//! platform default.

use std::env;
use std::path::{Path, PathBuf};

use tether_core::util::normalize_text_option;
use tether_core::SyncConfig;

use crate::cli::Cli;
use crate::error::CliError;

pub const DB_PATH_ENV: &str = "TETHER_DB_PATH";
pub const CONFIG_PATH_ENV: &str = "TETHER_CONFIG";
pub const BASE_URL_ENV: &str = "TETHER_BASE_URL";
pub const HEALTH_URL_ENV: &str = "TETHER_HEALTH_URL";
pub const TOKEN_ENV: &str = "TETHER_TOKEN";

#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub config: SyncConfig,
    pub token: Option<String>,
}

impl Settings {
    pub fn resolve(cli: &Cli) -> Result<Self, CliError> {
        let db_path = resolve_db_path(cli.db_path.clone(), env_path(DB_PATH_ENV));
        let config_path = resolve_config_path(cli.config.clone(), env_path(CONFIG_PATH_ENV));
        let mut config = load_config(config_path.as_deref())?;

        if let Some(base_url) = normalize_text_option(cli.base_url.clone()).or_else(|| env_text(BASE_URL_ENV)) {
            config.remote.base_url = Some(base_url);
        }
        if let Some(health_url) = env_text(HEALTH_URL_ENV) {
            config.remote.health_url = Some(health_url);
        }
        config
            .validate()
            .map_err(|error| CliError::Config(error.to_string()))?;

        Ok(Self {
            db_path,
            config,
            token: normalize_text_option(cli.token.clone()).or_else(|| env_text(TOKEN_ENV)),
        })
    }

    pub fn has_remote(&self) -> bool {
        self.config.remote.base_url().is_some()
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn env_text(name: &str) -> Option<String> {
    normalize_text_option(env::var(name).ok())
}

pub fn resolve_db_path(flag: Option<PathBuf>, from_env: Option<PathBuf>) -> PathBuf {
    flag.or(from_env).unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("tether.db")
}

/// Explicit paths are returned as given; the default is used only if it exists
pub fn resolve_config_path(flag: Option<PathBuf>, from_env: Option<PathBuf>) -> Option<PathBuf> {
    flag.or(from_env).or_else(|| {
        let default = dirs::config_dir()?.join("tether").join("config.json");
        default.exists().then_some(default)
    })
}

pub fn load_config(path: Option<&Path>) -> Result<SyncConfig, CliError> {
    match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Loading sync config");
            SyncConfig::load_from_path(path).map_err(|error| CliError::Config(error.to_string()))
        }
        None => Ok(SyncConfig::default()),
    }
}
