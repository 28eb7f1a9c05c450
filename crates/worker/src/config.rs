//! Worker configuration

use std::env;

/// Default expiry sweep schedule: every 5 minutes
pub const DEFAULT_SWEEP_SCHEDULE: &str = "0 */5 * * * *";
/// Default purge schedule: daily at 03:00 UTC
pub const DEFAULT_PURGE_SCHEDULE: &str = "0 0 3 * * *";

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,

    /// Cron expression (with seconds) for the expiry sweep, evaluated in UTC
    pub sweep_schedule: String,
    /// Cron expression (with seconds) for the inactive account purge, evaluated in UTC
    pub purge_schedule: String,
    pub enable_account_purge: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            sweep_schedule: env::var("SWEEP_SCHEDULE")
                .unwrap_or_else(|_| DEFAULT_SWEEP_SCHEDULE.to_string()),
            purge_schedule: env::var("PURGE_SCHEDULE")
                .unwrap_or_else(|_| DEFAULT_PURGE_SCHEDULE.to_string()),
            enable_account_purge: env::var("ENABLE_ACCOUNT_PURGE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}
