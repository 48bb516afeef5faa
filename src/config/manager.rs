//! Configuration Manager

use super::CmConfig;
use anyhow::{bail, Context, Result};
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<CmConfig> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: CmConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = CmConfig::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<CmConfig> {
        let mut config = CmConfig::default();

        if let Ok(max_ids) = std::env::var("RUSTCM_MAX_CONNECTION_IDS") {
            config.cm.max_connection_ids = max_ids
                .parse::<usize>()
                .with_context(|| format!("Invalid RUSTCM_MAX_CONNECTION_IDS: {}", max_ids))?;
        }

        if let Ok(pool) = std::env::var("RUSTCM_EVENT_POOL_SIZE") {
            config.cm.event_pool_size = pool
                .parse::<usize>()
                .with_context(|| format!("Invalid RUSTCM_EVENT_POOL_SIZE: {}", pool))?;
        }

        if let Ok(backlog) = std::env::var("RUSTCM_DEFAULT_BACKLOG") {
            config.cm.default_backlog = backlog
                .parse::<usize>()
                .with_context(|| format!("Invalid RUSTCM_DEFAULT_BACKLOG: {}", backlog))?;
        }

        if let Ok(timewait) = std::env::var("RUSTCM_TIMEWAIT_PERIOD") {
            config.timers.timewait_period = humantime::parse_duration(&timewait)
                .with_context(|| format!("Invalid RUSTCM_TIMEWAIT_PERIOD: {}", timewait))?;
        }

        if let Ok(timeout) = std::env::var("RUSTCM_RESPONSE_TIMEOUT") {
            config.timers.default_response_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid RUSTCM_RESPONSE_TIMEOUT: {}", timeout))?;
        }

        if let Ok(log_level) = std::env::var("RUSTCM_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl CmConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cm.max_connection_ids == 0 {
            bail!("max_connection_ids must be greater than 0");
        }

        if self.cm.max_connection_ids > 1_000_000 {
            bail!("max_connection_ids cannot exceed 1,000,000");
        }

        if self.cm.event_pool_size < 16 {
            bail!("event_pool_size must be at least 16");
        }

        if self.cm.default_backlog == 0 {
            bail!("default_backlog must be greater than 0");
        }

        if self.timers.timewait_period.as_millis() == 0 {
            bail!("timewait_period must be greater than 0");
        }

        if self.timers.timewait_period.as_secs() > 3600 {
            bail!("timewait_period cannot exceed 1 hour");
        }

        if self.timers.default_response_timeout.as_millis() == 0 {
            bail!("default_response_timeout must be greater than 0");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}
