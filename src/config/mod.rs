//! Configuration module - environment variable parsing

use std::env;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Display name announced in logs
    pub display_name: String,
    /// Optional fixed seed; wall-clock time is used when absent
    pub seed: Option<u32>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let seed = match env::var("SEED") {
            Ok(raw) => Some(raw.parse().map_err(|_| ConfigError::InvalidSeed)?),
            Err(_) => None,
        };

        Ok(Self {
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            display_name: env::var("DISPLAY_NAME").unwrap_or_else(|_| "tank-arena".to_string()),
            seed,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("SEED must be a 32-bit unsigned integer")]
    InvalidSeed,
}
