use serde::{Deserialize, Serialize};

/// Migration engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding migration sources.
    #[serde(default = "default_dir")]
    pub dir: String,

    /// Table recording applied migrations.
    #[serde(default = "default_history_table")]
    pub history_table: String,

    /// Name of the advisory lock held for the duration of a run.
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            history_table: default_history_table(),
            lock_name: default_lock_name(),
        }
    }
}

fn default_dir() -> String {
    "migrations".to_string()
}

fn default_history_table() -> String {
    "__strata_migrations".to_string()
}

fn default_lock_name() -> String {
    "strata_migrations".to_string()
}
