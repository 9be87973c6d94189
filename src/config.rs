use crate::session::{ManagerSettings, SchedulerSettings, SessionLimits};
use crate::storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub limits: SessionLimits,
    pub scheduler: SchedulerSettings,
    pub manager: ManagerSettings,
    pub storage: StorageConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.scheduler.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        if self.manager.mirror_every_n_activity == 0 {
            return Err(ConfigError::Invalid(
                "manager.mirror_every_n_activity must be greater than zero".to_string(),
            ));
        }

        if self.manager.flush_timeout_ms == 0 || self.manager.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "manager timeouts must be greater than zero".to_string(),
            ));
        }

        if let StorageConfig::File { directory } = &self.storage
            && directory.as_os_str().is_empty()
        {
            return Err(ConfigError::Invalid(
                "storage.directory must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Arc<AppConfig>, ConfigError> {
    let path = path.as_ref();
    info!("Loading configuration from: {}", path.display());

    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config: AppConfig = serde_yaml::from_str(&contents)?;
    config.validate()?;

    info!(
        "Configuration loaded: {} daily sessions per user, {} concurrent, {}ms duration, {} activity per session",
        config.limits.max_daily_sessions_per_user,
        config.limits.max_concurrent_sessions,
        config.limits.max_session_duration_ms,
        config.limits.max_activity_per_session
    );

    Ok(Arc::new(config))
}

/// Load configuration with fallback options, ending at built-in defaults
pub fn load_config_with_fallback() -> Arc<AppConfig> {
    if let Ok(config_path) = std::env::var("CONFIG_PATH") {
        match load_config(&config_path) {
            Ok(config) => return config,
            Err(e) => warn!(
                "Failed to load config from CONFIG_PATH ({}): {}",
                config_path, e
            ),
        }
    }

    for path in ["config.yaml", "config.yml"] {
        if Path::new(path).exists() {
            match load_config(path) {
                Ok(config) => return config,
                Err(e) => warn!("Failed to load config from '{}': {}", path, e),
            }
        }
    }

    info!("No configuration file found, using default limits");
    Arc::new(AppConfig::default())
}
