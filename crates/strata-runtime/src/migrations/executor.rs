use std::time::Instant;

use tracing::debug;

use strata_core::error::{Result, StrataError};
use strata_core::schema::{Operation, OperationSet};

use crate::driver::{Connection, StatementBuilder};

/// Applies operation sets through a connection's dialect.
///
/// Operations run strictly in order and the first failure aborts the rest
/// of the set. Transaction scope belongs to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationExecutor;

impl OperationExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Execute every operation in `operations`. Returns total rows affected.
    pub async fn execute<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        operations: &OperationSet,
    ) -> Result<u64> {
        let mut affected = 0;
        for op in operations {
            affected += self.execute_one(conn, op).await?;
        }
        Ok(affected)
    }

    pub async fn execute_one<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        op: &Operation,
    ) -> Result<u64> {
        op.validate()?;
        check_schema(conn, op).await?;

        let statements = conn.dialect().build(op)?;
        let start = Instant::now();
        let mut affected = 0;
        for sql in &statements {
            affected += conn.execute(sql).await?;
        }
        debug!(
            op = op.kind(),
            statements = statements.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "{}",
            op.describe()
        );
        Ok(affected)
    }

    /// Statements `operations` would run, without touching the database.
    pub fn plan(
        &self,
        dialect: &dyn StatementBuilder,
        operations: &OperationSet,
    ) -> Result<Vec<String>> {
        let mut statements = Vec::new();
        for op in operations {
            op.validate()?;
            statements.extend(dialect.build(op)?);
        }
        Ok(statements)
    }
}

async fn columns_of<C: Connection + ?Sized>(conn: &mut C, table: &str) -> Result<Vec<String>> {
    conn.table_columns(table)
        .await?
        .ok_or_else(|| StrataError::SchemaMismatch(format!("table {} does not exist", table)))
}

fn require_column(columns: &[String], table: &str, column: &str) -> Result<()> {
    if columns.iter().any(|c| c == column) {
        Ok(())
    } else {
        Err(StrataError::SchemaMismatch(format!(
            "column {}.{} does not exist",
            table, column
        )))
    }
}

fn require_absent(columns: &[String], table: &str, column: &str) -> Result<()> {
    if columns.iter().any(|c| c == column) {
        Err(StrataError::SchemaMismatch(format!(
            "column {}.{} already exists",
            table, column
        )))
    } else {
        Ok(())
    }
}

/// Verify the live schema matches what `op` assumes.
async fn check_schema<C: Connection + ?Sized>(conn: &mut C, op: &Operation) -> Result<()> {
    match op {
        Operation::AddColumn { table, column, .. } => {
            let columns = columns_of(conn, table).await?;
            require_absent(&columns, table, column)
        }
        Operation::DropColumn { table, column } | Operation::AlterColumn { table, column, .. } => {
            let columns = columns_of(conn, table).await?;
            require_column(&columns, table, column)
        }
        Operation::RenameColumn { table, from, to } => {
            let columns = columns_of(conn, table).await?;
            require_column(&columns, table, from)?;
            require_absent(&columns, table, to)
        }
        Operation::CreateTable { name, .. } => {
            if conn.table_exists(name).await? {
                return Err(StrataError::SchemaMismatch(format!(
                    "table {} already exists",
                    name
                )));
            }
            Ok(())
        }
        Operation::DropTable { name } => columns_of(conn, name).await.map(|_| ()),
        Operation::AddIndex { table, columns, .. }
        | Operation::AddPrimaryKey { table, columns, .. }
        | Operation::InsertRow { table, columns, .. } => {
            let existing = columns_of(conn, table).await?;
            columns
                .iter()
                .try_for_each(|c| require_column(&existing, table, c))
        }
        Operation::UpdateRow {
            table,
            key_column,
            columns,
            ..
        } => {
            let existing = columns_of(conn, table).await?;
            require_column(&existing, table, key_column)?;
            columns
                .iter()
                .try_for_each(|c| require_column(&existing, table, c))
        }
        Operation::DeleteRow {
            table, key_column, ..
        } => {
            let existing = columns_of(conn, table).await?;
            require_column(&existing, table, key_column)
        }
        Operation::AddForeignKey {
            table,
            column,
            principal_table,
            principal_column,
            ..
        } => {
            let existing = columns_of(conn, table).await?;
            require_column(&existing, table, column)?;
            let principal = columns_of(conn, principal_table).await?;
            require_column(&principal, principal_table, principal_column)
        }
        Operation::DropIndex { table, .. }
        | Operation::DropForeignKey { table, .. }
        | Operation::DropPrimaryKey { table, .. } => columns_of(conn, table).await.map(|_| ()),
        Operation::RawStatement { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDatabase;
    use strata_core::schema::{ColumnDef, ColumnType, PrimaryKeyDef, Value};

    fn create_events() -> Operation {
        Operation::CreateTable {
            name: "Events".into(),
            columns: vec![
                ColumnDef::new("Id", ColumnType::Integer).not_null(),
                ColumnDef::new("MaxParticipants", ColumnType::Integer),
            ],
            primary_key: Some(PrimaryKeyDef {
                name: "PK_Events".into(),
                columns: vec!["Id".into()],
            }),
            foreign_keys: vec![],
        }
    }

    #[tokio::test]
    async fn test_drop_missing_column_is_schema_mismatch() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        let executor = OperationExecutor::new();
        executor
            .execute(&mut conn, &OperationSet::new(vec![create_events()]))
            .await
            .unwrap();

        let err = executor
            .execute_one(
                &mut conn,
                &Operation::DropColumn {
                    table: "Events".into(),
                    column: "Weight".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::SchemaMismatch(_)));
    }

    #[tokio::test]
    async fn test_rename_onto_existing_column_fails() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        let executor = OperationExecutor::new();
        executor.execute_one(&mut conn, &create_events()).await.unwrap();

        let err = executor
            .execute_one(
                &mut conn,
                &Operation::RenameColumn {
                    table: "Events".into(),
                    from: "MaxParticipants".into(),
                    to: "Id".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::SchemaMismatch(_)));
        assert_eq!(db.columns("Events").unwrap(), vec!["Id", "MaxParticipants"]);
    }

    #[tokio::test]
    async fn test_unsafe_alter_rejected_before_any_statement() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        let executor = OperationExecutor::new();
        executor.execute_one(&mut conn, &create_events()).await.unwrap();
        let before = db.statements().len();

        let err = executor
            .execute_one(
                &mut conn,
                &Operation::AlterColumn {
                    table: "Events".into(),
                    column: "MaxParticipants".into(),
                    new_type: ColumnType::Integer,
                    old_type: ColumnType::Integer,
                    nullable: false,
                    old_nullable: true,
                    default: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::UnsafeAlter { .. }));
        assert_eq!(db.statements().len(), before);
    }

    #[tokio::test]
    async fn test_first_failure_aborts_remaining_operations() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        let executor = OperationExecutor::new();

        let set = OperationSet::new(vec![
            create_events(),
            Operation::InsertRow {
                table: "Missing".into(),
                columns: vec!["Id".into()],
                values: vec![Value::Int(1)],
            },
            Operation::InsertRow {
                table: "Events".into(),
                columns: vec!["Id".into()],
                values: vec![Value::Int(1)],
            },
        ]);

        assert!(executor.execute(&mut conn, &set).await.is_err());
        assert!(db.rows("Events").is_empty());
    }

    #[test]
    fn test_plan_builds_without_database() {
        let set = OperationSet::new(vec![
            create_events(),
            Operation::RawStatement {
                sql: "UPDATE \"Events\" SET \"MaxParticipants\" = 0".into(),
            },
        ]);
        let statements = OperationExecutor::new()
            .plan(&crate::testing::MemoryDialect, &set)
            .unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1], "UPDATE \"Events\" SET \"MaxParticipants\" = 0");
    }
}
