//! Migration engine: registry, history, execution and the runner.

mod executor;
mod history;
mod loader;
mod registry;
mod runner;
mod split;

pub use executor::OperationExecutor;
pub use history::{HistoryRecord, HistoryStore, DEFAULT_HISTORY_TABLE};
pub use loader::{load_migrations_from_dir, load_registry};
pub use registry::MigrationRegistry;
pub use runner::{
    Direction, MigrationReport, MigrationRunner, MigrationStatus, PlannedMigration, RunnerOptions,
    RunnerState, Target, DEFAULT_LOCK_NAME,
};
pub use split::split_sql_statements;
