//! Environment configuration for the engine host.

use serde::Deserialize;
use std::env;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// SQLite database path/URL
    pub database_url: String,
    /// Deployment environment; "prod" enables two-person approvals
    pub env: String,
    /// Platform-wide exam-mode flag, snapshotted onto sessions
    pub exam_mode: bool,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let exam_mode_raw = env_var_or("MEDEX_EXAM_MODE", "false");
        let exam_mode = match exam_mode_raw.as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            other => {
                return Err(ConfigError::InvalidValue(
                    "MEDEX_EXAM_MODE".to_string(),
                    other.to_string(),
                ))
            }
        };

        Ok(Self {
            database_url: env_var("MEDEX_DATABASE_URL")?,
            env: env_var_or("MEDEX_ENV", "dev"),
            exam_mode,
        })
    }

    pub fn is_production(&self) -> bool {
        self.env == "prod"
    }
}

fn env_var(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn env_var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}
