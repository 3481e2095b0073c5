use serde::{Deserialize, Serialize};

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL.
    pub url: String,

    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Statement timeout in seconds. Zero keeps the server default.
    #[serde(default)]
    pub statement_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            statement_timeout_secs: 0,
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_database_config() {
        let config = DatabaseConfig::default();
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.statement_timeout_secs, 0);
    }

    #[test]
    fn test_parse_database_config() {
        let toml = r#"
            url = "postgres://localhost/trashmob"
            statement_timeout_secs = 120
        "#;

        let config: DatabaseConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.url, "postgres://localhost/trashmob");
        assert_eq!(config.statement_timeout_secs, 120);
        assert_eq!(config.connect_timeout_secs, 30);
    }
}
