//! Worker configuration

use std::env;
use std::time::Duration;

/// Every minute (seconds field first)
pub const DEFAULT_RECONCILE_CRON: &str = "0 * * * * *";
/// Every ten minutes
pub const DEFAULT_EXPIRY_CRON: &str = "0 */10 * * * *";
pub const DEFAULT_RECONCILE_MIN_AGE_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub reconcile_cron: String,
    pub expiry_cron: String,
    /// Open payments untouched for this long get polled
    pub reconcile_min_age: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, WorkerConfigError> {
        let reconcile_min_age_secs = match env::var("RECONCILE_MIN_AGE_SECS") {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| WorkerConfigError::Invalid("RECONCILE_MIN_AGE_SECS must be a number of seconds"))?,
            Err(_) => DEFAULT_RECONCILE_MIN_AGE_SECS,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| WorkerConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            reconcile_cron: env::var("RECONCILE_CRON")
                .unwrap_or_else(|_| DEFAULT_RECONCILE_CRON.to_string()),
            expiry_cron: env::var("EXPIRY_CRON").unwrap_or_else(|_| DEFAULT_EXPIRY_CRON.to_string()),
            reconcile_min_age: Duration::from_secs(reconcile_min_age_secs),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_worker_config() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();
        env::remove_var("RECONCILE_CRON");
        env::remove_var("RECONCILE_MIN_AGE_SECS");

        env::remove_var("DATABASE_URL");
        assert!(matches!(
            WorkerConfig::from_env(),
            Err(WorkerConfigError::Missing("DATABASE_URL"))
        ));

        env::set_var("DATABASE_URL", "postgres://test");
        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.reconcile_cron, DEFAULT_RECONCILE_CRON);
        assert_eq!(config.reconcile_min_age, Duration::from_secs(120));

        env::set_var("RECONCILE_MIN_AGE_SECS", "30");
        assert_eq!(
            WorkerConfig::from_env().unwrap().reconcile_min_age,
            Duration::from_secs(30)
        );

        env::set_var("RECONCILE_MIN_AGE_SECS", "soon");
        assert!(matches!(
            WorkerConfig::from_env(),
            Err(WorkerConfigError::Invalid(_))
        ));

        env::remove_var("RECONCILE_MIN_AGE_SECS");
        env::remove_var("DATABASE_URL");
    }
}
