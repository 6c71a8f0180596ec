//! Configuration types.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Engine service configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Port of the HTTP binding.
    pub http_port: u16,
    /// JSON catalog of steps and onboardings applied at startup.
    pub catalog_path: Option<PathBuf>,
    /// How many times a duplicate-progress insert is retried as a lookup.
    pub progress_create_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/onboarding.db"),
            http_port: 8080,
            catalog_path: None,
            progress_create_retries: 1,
        }
    }
}

impl EngineConfig {
    /// Read configuration from `ONBOARDING_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("ONBOARDING_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(port) = lookup("ONBOARDING_HTTP_PORT") {
            config.http_port = parse_number("ONBOARDING_HTTP_PORT", &port)?;
        }
        config.catalog_path = lookup("ONBOARDING_CATALOG_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        if let Some(retries) = lookup("ONBOARDING_PROGRESS_RETRIES") {
            config.progress_create_retries = parse_number("ONBOARDING_PROGRESS_RETRIES", &retries)?;
        }

        Ok(config)
    }
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
