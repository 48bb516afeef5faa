//! Configuration Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CmConfig {
    pub cm: CoreConfig,
    pub timers: TimerConfig,
    pub monitoring: MonitoringConfig,
}

/// Core state machine limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreConfig {
    /// Upper bound on live connection identifiers.
    pub max_connection_ids: usize,
    /// Upper bound on delivered-but-unreleased events.
    pub event_pool_size: usize,
    /// Pending-request cap applied when `listen` is given a zero backlog.
    pub default_backlog: usize,
}

/// Timer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimerConfig {
    /// How long an identifier lingers in TimeWait before recycling to Idle.
    #[serde(with = "humantime_serde")]
    pub timewait_period: Duration,
    /// Per-attempt response timeout used when request params leave it unset.
    #[serde(with = "humantime_serde")]
    pub default_response_timeout: Duration,
    /// Retry budget used when request params leave it unset.
    pub default_max_retries: u8,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub log_level: String,
}

impl Default for CmConfig {
    fn default() -> Self {
        Self {
            cm: CoreConfig {
                max_connection_ids: 1024,
                event_pool_size: 256,
                default_backlog: 64,
            },
            timers: TimerConfig {
                timewait_period: Duration::from_millis(150),
                default_response_timeout: Duration::from_secs(2),
                default_max_retries: 3,
            },
            monitoring: MonitoringConfig {
                log_level: "info".to_string(),
            },
        }
    }
}
