//! Application configuration

use std::env;
use std::time::Duration;

/// Default token cost of one generated illustration
pub const DEFAULT_ILLUSTRATION_COST: i64 = 10;

/// Application configuration loaded from environment variables
#[derive(Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,
    pub cors_allowed_origins: Vec<String>,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Illustrations
    pub illustration_cost: i64,
    pub image_api_url: String,
    pub image_api_key: Option<String>,
    pub image_model: String,
    pub image_timeout: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("public_url", &self.public_url)
            .field("cors_allowed_origins", &self.cors_allowed_origins)
            .field("database_max_connections", &self.database_max_connections)
            .field("illustration_cost", &self.illustration_cost)
            .field("image_api_url", &self.image_api_url)
            .field("image_api_key", &self.image_api_key.as_ref().map(|_| "<redacted>"))
            .field("image_model", &self.image_model)
            .field("image_timeout", &self.image_timeout)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let illustration_cost = match env::var("ILLUSTRATION_COST_TOKENS") {
            Ok(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|_| ConfigError::Invalid("ILLUSTRATION_COST_TOKENS must be an integer"))?,
            Err(_) => DEFAULT_ILLUSTRATION_COST,
        };
        if illustration_cost <= 0 {
            return Err(ConfigError::Invalid(
                "ILLUSTRATION_COST_TOKENS must be positive",
            ));
        }

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(folio_shared::db::DEFAULT_MAX_CONNECTIONS),

            // Illustrations
            illustration_cost,
            image_api_url: env::var("IMAGE_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            image_api_key: env::var("IMAGE_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            image_model: env::var("IMAGE_MODEL").unwrap_or_else(|_| "dall-e-3".to_string()),
            image_timeout: Duration::from_secs(
                env::var("IMAGE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
            ),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
