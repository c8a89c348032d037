//! Application configuration: YAML file plus environment overrides.
//!
//! Resolution order: defaults, then the YAML file (`PARCEL_CONFIG`, else
//! `config/parcel.yaml` when present), then `DATABASE_URL`,
//! `DATABASE_POOL_SIZE` and `PARCEL_LOG`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use parcel_core::config::EngineConfig;

pub const CONFIG_ENV: &str = "PARCEL_CONFIG";
pub const LOG_ENV: &str = "PARCEL_LOG";
pub const DEFAULT_CONFIG_PATH: &str = "config/parcel.yaml";
pub const DEFAULT_LOG_FILTER: &str = "info,parcel_engine=debug";

/// Where evaluated context layers are cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextCacheBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[cfg(feature = "database")]
    pub database: parcel_postgres::DatabaseConfig,
    pub engine: EngineConfig,
    pub log_filter: String,
    pub context_cache: ContextCacheBackend,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            #[cfg(feature = "database")]
            database: parcel_postgres::DatabaseConfig::default(),
            engine: EngineConfig::default(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            context_cache: ContextCacheBackend::default(),
        }
    }
}

impl AppConfig {
    /// Load `.env`, the config file and environment overrides.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let path = std::env::var(CONFIG_ENV)
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            });
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn apply_env(&mut self) {
        if let Ok(filter) = std::env::var(LOG_ENV) {
            self.log_filter = filter;
        }
        #[cfg(feature = "database")]
        self.database.apply_env();
    }
}
