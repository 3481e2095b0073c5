use thiserror::Error;

/// Core error type for strata operations.
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A migration with this id is already registered.
    #[error("Duplicate migration id: {0}")]
    DuplicateId(String),

    /// Registry lookup for an unknown id.
    #[error("Migration not found: {0}")]
    NotFound(String),

    /// An operation assumed schema state that does not hold.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Narrowing a column to NOT NULL without a backfill default.
    #[error("Unsafe alter of {table}.{column}: making a column non-nullable requires a default")]
    UnsafeAlter { table: String, column: String },

    #[error("Out of order revert: {requested} is not the most recently applied migration (latest is {latest})")]
    OutOfOrderRevert { requested: String, latest: String },

    #[error("Migration {0} is already recorded as applied")]
    DuplicateApplication(String),

    #[error("Migration {0} is not recorded as applied")]
    NotApplied(String),

    /// Another runner holds the migration lock. Safe to retry after backoff.
    #[error("Migration runner busy: lock '{0}' is held by another process")]
    RunnerBusy(String),

    #[error("Migration {migration_id} failed: {source}")]
    TransactionFailed {
        migration_id: String,
        #[source]
        source: Box<StrataError>,
    },

    #[error("Migration run cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Wrap an error with the id of the migration that produced it.
    pub fn in_migration(migration_id: impl Into<String>, source: StrataError) -> Self {
        StrataError::TransactionFailed {
            migration_id: migration_id.into(),
            source: Box::new(source),
        }
    }

    /// The underlying cause, looking through `TransactionFailed`.
    pub fn root(&self) -> &StrataError {
        match self {
            StrataError::TransactionFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// The id of the migration that failed, if the error carries one.
    pub fn migration_id(&self) -> Option<&str> {
        match self {
            StrataError::TransactionFailed { migration_id, .. } => Some(migration_id),
            _ => None,
        }
    }

    /// Whether the caller may retry the same call after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), StrataError::RunnerBusy(_))
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for StrataError {
    fn from(e: toml::de::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_transaction_failed() {
        let err = StrataError::in_migration(
            "20240101000000_init",
            StrataError::SchemaMismatch("column Users.Email does not exist".into()),
        );

        assert_eq!(err.migration_id(), Some("20240101000000_init"));
        assert!(matches!(err.root(), StrataError::SchemaMismatch(_)));
        assert!(err.to_string().contains("20240101000000_init"));
        assert!(err.to_string().contains("Users.Email"));
    }

    #[test]
    fn test_only_lock_contention_is_retryable() {
        assert!(StrataError::RunnerBusy("strata".into()).is_retryable());
        assert!(!StrataError::NotApplied("x".into()).is_retryable());
        assert!(!StrataError::in_migration("x", StrataError::Database("boom".into())).is_retryable());
    }
}
