//! Database driver seam.
//!
//! The engine talks to a database only through [`Connection`]. Dialect
//! differences live behind [`StatementBuilder`], which turns operations into
//! statement text; the executor never builds SQL itself.

mod postgres;

pub use postgres::{PostgresConnection, PostgresDialect};

use async_trait::async_trait;
use strata_core::error::Result;
use strata_core::schema::{Operation, Value};

/// A fetched row, one value per selected column.
pub type Row = Vec<Value>;

/// Turns operations into dialect-specific statements.
pub trait StatementBuilder: Send + Sync {
    /// Statements implementing one operation, in execution order.
    fn build(&self, operation: &Operation) -> Result<Vec<String>>;

    /// A query returning `columns` from `table`, optionally filtered on a
    /// single column and ordered by the given columns ascending.
    fn select(
        &self,
        table: &str,
        columns: &[&str],
        filter: Option<(&str, &Value)>,
        order_by: &[&str],
    ) -> Result<String>;
}

/// A session against the target database.
///
/// Locks are session-scoped: an implementation must keep the same physical
/// session for the lifetime of the value.
#[async_trait]
pub trait Connection: Send {
    /// The statement builder for this connection's dialect.
    fn dialect(&self) -> &dyn StatementBuilder;

    async fn begin_transaction(&mut self) -> Result<()>;

    /// Execute a statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<Row>>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Try to take the named advisory lock without blocking.
    async fn try_acquire_lock(&mut self, name: &str) -> Result<bool>;

    async fn release_lock(&mut self, name: &str) -> Result<()>;

    async fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Column names of `table` in declaration order, `None` if the table is missing.
    async fn table_columns(&mut self, table: &str) -> Result<Option<Vec<String>>>;
}
