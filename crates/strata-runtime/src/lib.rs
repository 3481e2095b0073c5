//! Runtime for the strata migration engine: database drivers and the
//! migration runner.

pub mod driver;
pub mod migrations;
pub mod testing;

pub use driver::{Connection, PostgresConnection, PostgresDialect, StatementBuilder};
pub use migrations::{
    load_registry, MigrationRegistry, MigrationReport, MigrationRunner, MigrationStatus,
    RunnerOptions, Target,
};
