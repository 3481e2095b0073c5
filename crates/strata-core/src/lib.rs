//! Core types for the strata schema-migration engine: the operation model,
//! the error taxonomy and configuration.

pub mod config;
pub mod error;
pub mod schema;

pub use config::StrataConfig;
pub use error::{Result, StrataError};
pub use schema::{
    ColumnDef, ColumnType, ForeignKeyDef, MigrationScript, Operation, OperationSet,
    PrimaryKeyDef, ReferentialAction, Value,
};
