use std::env;
use std::str::FromStr;
use std::time::Duration;

use validator::Validate;

/// Prefix for all scheduler environment variables
const ENV_PREFIX: &str = "CALENDAR_SYNC_";

/// Tunables for the sync scheduler
#[derive(Debug, Clone, Validate)]
pub struct SyncConfig {
    /// Global switch for scheduled syncs (default: true)
    pub sync_enabled: bool,

    /// Respectful mode; scheduled batches only run when enabled (default: true)
    pub respectful_sync_enabled: bool,

    /// Base delay between syncs of the same domain (default: 10 seconds)
    pub min_delay_between_syncs_ms: u64,

    /// Maximum property syncs in flight (default: 2)
    #[validate(range(min = 1, message = "max_concurrent_syncs must be at least 1"))]
    pub max_concurrent_syncs: usize,

    /// Scale delays with observed failures and successes (default: true)
    pub adaptive_delay_enabled: bool,

    /// Refuse to start the daily batch when most requests fail (default: true)
    pub circuit_breaker_enabled: bool,

    /// Growth factor for backoff and the delay multiplier (default: 1.5)
    #[validate(range(
        min = 1.0,
        max = 10.0,
        message = "backoff_multiplier must be between 1 and 10"
    ))]
    pub backoff_multiplier: f64,

    /// Requested properties per daily batch, further capped at 4 (default: 4)
    #[validate(range(min = 1, message = "sync_max_properties must be at least 1"))]
    pub sync_max_properties: usize,

    /// Cron expression for the daily batch (default: 02:00 every day)
    #[validate(length(min = 1, message = "daily_sync_cron is required"))]
    pub daily_sync_cron: String,

    /// Cron expression for the priority batch (default: every 6 hours)
    #[validate(length(min = 1, message = "priority_sync_cron is required"))]
    pub priority_sync_cron: String,

    /// Base URL of the calendar extraction service
    #[validate(url(message = "extraction_service_url must be a valid URL"))]
    pub extraction_service_url: String,

    /// Timeout for a single extraction call (default: 2 minutes)
    pub extraction_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_enabled: true,
            respectful_sync_enabled: true,
            min_delay_between_syncs_ms: 10_000,
            max_concurrent_syncs: 2,
            adaptive_delay_enabled: true,
            circuit_breaker_enabled: true,
            backoff_multiplier: 1.5,
            sync_max_properties: 4,
            daily_sync_cron: "0 0 2 * * *".to_string(),
            priority_sync_cron: "0 0 */6 * * *".to_string(),
            extraction_service_url: "http://localhost:3001".to_string(),
            extraction_timeout: Duration::from_secs(120),
        }
    }
}

/// Errors loading the scheduler configuration
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
    },

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

impl SyncConfig {
    /// Load configuration from `CALENDAR_SYNC_*` environment variables,
    /// falling back to the defaults for anything unset
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            sync_enabled: env_or("ENABLED", defaults.sync_enabled)?,
            respectful_sync_enabled: env_or("RESPECTFUL", defaults.respectful_sync_enabled)?,
            min_delay_between_syncs_ms: env_or(
                "MIN_DELAY_MS",
                defaults.min_delay_between_syncs_ms,
            )?,
            max_concurrent_syncs: env_or("MAX_CONCURRENT", defaults.max_concurrent_syncs)?,
            adaptive_delay_enabled: env_or("ADAPTIVE_DELAY", defaults.adaptive_delay_enabled)?,
            circuit_breaker_enabled: env_or(
                "CIRCUIT_BREAKER",
                defaults.circuit_breaker_enabled,
            )?,
            backoff_multiplier: env_or("BACKOFF_MULTIPLIER", defaults.backoff_multiplier)?,
            sync_max_properties: env_or("MAX_PROPERTIES", defaults.sync_max_properties)?,
            daily_sync_cron: env_or("DAILY_CRON", defaults.daily_sync_cron)?,
            priority_sync_cron: env_or("PRIORITY_CRON", defaults.priority_sync_cron)?,
            extraction_service_url: env_or("EXTRACTION_URL", defaults.extraction_service_url)?,
            extraction_timeout: Duration::from_secs(env_or(
                "EXTRACTION_TIMEOUT_SECS",
                defaults.extraction_timeout.as_secs(),
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    /// Base delay between syncs of the same domain
    pub fn min_delay_between_syncs(&self) -> Duration {
        Duration::from_millis(self.min_delay_between_syncs_ms)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    let key = format!("{ENV_PREFIX}{name}");
    match env::var(&key) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key,
                    value: value.clone(),
                })
        }
        _ => Ok(default),
    }
}
