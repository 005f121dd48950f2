//! Tunables for the billing core
//!
//! Configuration via environment variables:
//! - `WELCOME_BONUS_TOKENS`: one-time grant for new users (default: 300)
//! - `PAYMENT_POLL_MAX_RETRIES`: retries for a status poll (default: 3)
//! - `PAYMENT_POLL_BASE_DELAY_MS`: first backoff delay (default: 200)
//! - `PAYMENT_EXPIRY_HOURS`: age after which open payments expire (default: 24)

use std::time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::users::DEFAULT_WELCOME_BONUS;

const DEFAULT_POLL_MAX_RETRIES: usize = 3;
const DEFAULT_POLL_BASE_DELAY_MS: u64 = 200;
const DEFAULT_PAYMENT_EXPIRY_HOURS: u64 = 24;

#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub welcome_bonus: i64,
    pub poll_max_retries: usize,
    pub poll_base_delay: Duration,
    pub payment_expiry: Duration,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            welcome_bonus: DEFAULT_WELCOME_BONUS,
            poll_max_retries: DEFAULT_POLL_MAX_RETRIES,
            poll_base_delay: Duration::from_millis(DEFAULT_POLL_BASE_DELAY_MS),
            payment_expiry: Duration::from_secs(DEFAULT_PAYMENT_EXPIRY_HOURS * 3600),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> BillingResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| BillingError::Config(format!("{} is not a valid number", name))),
        _ => Ok(None),
    }
}

impl BillingSettings {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let welcome_bonus = env_parse::<i64>("WELCOME_BONUS_TOKENS")?.unwrap_or(defaults.welcome_bonus);
        if welcome_bonus < 0 {
            return Err(BillingError::Config(
                "WELCOME_BONUS_TOKENS must not be negative".to_string(),
            ));
        }

        let expiry_hours = env_parse::<u64>("PAYMENT_EXPIRY_HOURS")?
            .unwrap_or(DEFAULT_PAYMENT_EXPIRY_HOURS);
        if expiry_hours == 0 {
            return Err(BillingError::Config(
                "PAYMENT_EXPIRY_HOURS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            welcome_bonus,
            poll_max_retries: env_parse::<usize>("PAYMENT_POLL_MAX_RETRIES")?
                .unwrap_or(defaults.poll_max_retries),
            poll_base_delay: env_parse::<u64>("PAYMENT_POLL_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_base_delay),
            payment_expiry: Duration::from_secs(expiry_hours * 3600),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear() {
        for name in [
            "WELCOME_BONUS_TOKENS",
            "PAYMENT_POLL_MAX_RETRIES",
            "PAYMENT_POLL_BASE_DELAY_MS",
            "PAYMENT_EXPIRY_HOURS",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_settings_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();

        clear();
        let settings = BillingSettings::from_env().unwrap();
        assert_eq!(settings.welcome_bonus, 300);
        assert_eq!(settings.poll_max_retries, 3);
        assert_eq!(settings.payment_expiry, Duration::from_secs(24 * 3600));

        std::env::set_var("WELCOME_BONUS_TOKENS", "50");
        std::env::set_var("PAYMENT_POLL_BASE_DELAY_MS", "10");
        std::env::set_var("PAYMENT_EXPIRY_HOURS", "2");
        let settings = BillingSettings::from_env().unwrap();
        assert_eq!(settings.welcome_bonus, 50);
        assert_eq!(settings.poll_base_delay, Duration::from_millis(10));
        assert_eq!(settings.payment_expiry, Duration::from_secs(7200));

        std::env::set_var("WELCOME_BONUS_TOKENS", "-1");
        assert!(BillingSettings::from_env().is_err());

        std::env::set_var("WELCOME_BONUS_TOKENS", "lots");
        assert!(BillingSettings::from_env().is_err());

        std::env::set_var("WELCOME_BONUS_TOKENS", "10");
        std::env::set_var("PAYMENT_EXPIRY_HOURS", "0");
        assert!(BillingSettings::from_env().is_err());

        clear();
    }
}
