use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// HTTP endpoint of the SMS gateway
    pub sms_gateway_url: Option<String>,

    /// Bearer token for the SMS gateway
    pub sms_gateway_token: Option<String>,

    /// Queue, batching and retry tunables
    pub dispatch: DispatchConfig,
}

/// Tunables of the bulk dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DispatchConfig {
    /// Recipients per email batch (default: 50)
    pub email_batch_size: usize,
    /// Recipients per SMS batch (default: 100)
    pub sms_batch_size: usize,
    /// Email scheduler period in milliseconds (default: 30000)
    pub email_tick_ms: u64,
    /// SMS scheduler period in milliseconds (default: 15000)
    pub sms_tick_ms: u64,
    /// Upper bound on batches in flight for one job (default: 5)
    pub max_concurrent_batches: usize,
    /// Processing attempts before a job is marked failed (default: 3)
    pub max_attempts: u32,
    /// Delay before a failed job is re-enqueued, in seconds (default: 30)
    pub retry_delay_secs: u64,
    /// Cleanup sweep period in seconds (default: 3600)
    pub cleanup_interval_secs: u64,
    /// Age after which terminal jobs are purged, in days (default: 30)
    pub retention_days: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            email_batch_size: 50,
            sms_batch_size: 100,
            email_tick_ms: 30_000,
            sms_tick_ms: 15_000,
            max_concurrent_batches: 5,
            max_attempts: 3,
            retry_delay_secs: 30,
            cleanup_interval_secs: 3_600,
            retention_days: 30,
        }
    }
}

impl DispatchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    /// Load dispatch tunables from the environment, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            email_batch_size: env_or("EMAIL_BATCH_SIZE", defaults.email_batch_size)?,
            sms_batch_size: env_or("SMS_BATCH_SIZE", defaults.sms_batch_size)?,
            email_tick_ms: env_or("EMAIL_TICK_MS", defaults.email_tick_ms)?,
            sms_tick_ms: env_or("SMS_TICK_MS", defaults.sms_tick_ms)?,
            max_concurrent_batches: env_or(
                "MAX_CONCURRENT_BATCHES",
                defaults.max_concurrent_batches,
            )?,
            max_attempts: env_or("MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_delay_secs: env_or("RETRY_DELAY_SECS", defaults.retry_delay_secs)?,
            cleanup_interval_secs: env_or(
                "CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval_secs,
            )?,
            retention_days: env_or("RETENTION_DAYS", defaults.retention_days)?,
        })
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            sms_gateway_url: std::env::var("SMS_GATEWAY_URL").ok(),
            sms_gateway_token: std::env::var("SMS_GATEWAY_TOKEN").ok(),
            dispatch: DispatchConfig::from_env()?,
        })
    }
}

/// Parse `key` from the environment, or return `default` when unset.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_defaults() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.email_batch_size, 50);
        assert_eq!(cfg.sms_batch_size, 100);
        assert_eq!(cfg.max_concurrent_batches, 5);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.retry_delay(), Duration::from_secs(30));
        assert_eq!(cfg.retention(), chrono::Duration::days(30));
    }

    #[test]
    fn test_env_or_falls_back_when_unset() {
        let value: u64 = env_or("BEACON_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
