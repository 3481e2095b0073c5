mod database;
mod logging;
mod migrations;

pub use database::DatabaseConfig;
pub use logging::LoggingConfig;
pub use migrations::MigrationsConfig;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, StrataError};

/// Root configuration, usually read from `strata.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Database configuration.
    pub database: DatabaseConfig,

    /// Migration engine configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StrataConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| StrataError::Config(format!("Failed to read config file: {}", e)))?;
        tracing::debug!("Loaded configuration from {}", path.display());

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);

        toml::from_str(&content)
            .map_err(|e| StrataError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Configuration with defaults and the given database URL.
    pub fn default_with_database_url(url: &str) -> Self {
        Self {
            database: DatabaseConfig {
                url: url.to_string(),
                ..Default::default()
            },
            migrations: MigrationsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Substitute environment variables in the format ${VAR_NAME}.
/// Unset variables are left as-is.
fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}
