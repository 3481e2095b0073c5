//! Applied-migration bookkeeping stored in the target database.

use chrono::{DateTime, Utc};
use tracing::debug;

use strata_core::error::{Result, StrataError};
use strata_core::schema::{ColumnDef, ColumnType, Operation, PrimaryKeyDef, Value};

use crate::driver::Connection;

/// Default name of the history table.
pub const DEFAULT_HISTORY_TABLE: &str = "__strata_migrations";

const ID_COLUMN: &str = "MigrationId";
const APPLIED_AT_COLUMN: &str = "AppliedAtUtc";

/// One applied migration.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub migration_id: String,
    pub applied_at: DateTime<Utc>,
}

/// Reads and writes the history table.
///
/// Mutators do not open transactions; the runner calls them inside the
/// transaction that executes the migration itself.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    table: String,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_TABLE)
    }
}

impl HistoryStore {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn create_operation(&self) -> Operation {
        Operation::CreateTable {
            name: self.table.clone(),
            columns: vec![
                ColumnDef::new(ID_COLUMN, ColumnType::Text).not_null(),
                ColumnDef::new(APPLIED_AT_COLUMN, ColumnType::Timestamptz).not_null(),
            ],
            primary_key: Some(PrimaryKeyDef {
                name: format!("PK_{}", self.table),
                columns: vec![ID_COLUMN.to_string()],
            }),
            foreign_keys: vec![],
        }
    }

    async fn run<C: Connection + ?Sized>(conn: &mut C, op: &Operation) -> Result<u64> {
        let statements = conn.dialect().build(op)?;
        let mut affected = 0;
        for sql in &statements {
            affected += conn.execute(sql).await?;
        }
        Ok(affected)
    }

    /// Create the history table if it does not exist. Returns whether it was created.
    pub async fn ensure_initialized<C: Connection + ?Sized>(&self, conn: &mut C) -> Result<bool> {
        if conn.table_exists(&self.table).await? {
            return Ok(false);
        }
        debug!("Creating migration history table {}", self.table);
        Self::run(conn, &self.create_operation()).await?;
        Ok(true)
    }

    /// Applied migrations ordered by application time.
    ///
    /// A missing history table means nothing has been applied.
    pub async fn applied<C: Connection + ?Sized>(&self, conn: &mut C) -> Result<Vec<HistoryRecord>> {
        if !conn.table_exists(&self.table).await? {
            return Ok(Vec::new());
        }

        let sql = conn.dialect().select(
            &self.table,
            &[ID_COLUMN, APPLIED_AT_COLUMN],
            None,
            &[APPLIED_AT_COLUMN, ID_COLUMN],
        )?;

        conn.fetch_all(&sql)
            .await?
            .into_iter()
            .map(|row| match row.as_slice() {
                [id, applied_at] => match (id.as_str(), applied_at.as_timestamp()) {
                    (Some(id), Some(applied_at)) => Ok(HistoryRecord {
                        migration_id: id.to_string(),
                        applied_at,
                    }),
                    _ => Err(StrataError::Internal(format!(
                        "malformed row in {}: {:?}",
                        self.table, row
                    ))),
                },
                _ => Err(StrataError::Internal(format!(
                    "expected 2 columns from {}, got {}",
                    self.table,
                    row.len()
                ))),
            })
            .collect()
    }

    pub async fn applied_ids<C: Connection + ?Sized>(&self, conn: &mut C) -> Result<Vec<String>> {
        Ok(self
            .applied(conn)
            .await?
            .into_iter()
            .map(|r| r.migration_id)
            .collect())
    }

    pub async fn is_applied<C: Connection + ?Sized>(&self, conn: &mut C, id: &str) -> Result<bool> {
        if !conn.table_exists(&self.table).await? {
            return Ok(false);
        }
        let key = Value::from(id);
        let sql = conn
            .dialect()
            .select(&self.table, &[ID_COLUMN], Some((ID_COLUMN, &key)), &[])?;
        Ok(!conn.fetch_all(&sql).await?.is_empty())
    }

    pub async fn record_applied<C: Connection + ?Sized>(&self, conn: &mut C, id: &str) -> Result<()> {
        if self.is_applied(conn, id).await? {
            return Err(StrataError::DuplicateApplication(id.to_string()));
        }
        let op = Operation::InsertRow {
            table: self.table.clone(),
            columns: vec![ID_COLUMN.to_string(), APPLIED_AT_COLUMN.to_string()],
            values: vec![Value::from(id), Value::Timestamp(Utc::now())],
        };
        Self::run(conn, &op).await?;
        Ok(())
    }

    pub async fn record_reverted<C: Connection + ?Sized>(&self, conn: &mut C, id: &str) -> Result<()> {
        let op = Operation::DeleteRow {
            table: self.table.clone(),
            key_column: ID_COLUMN.to_string(),
            key_value: Value::from(id),
        };
        match Self::run(conn, &op).await? {
            0 => Err(StrataError::NotApplied(id.to_string())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDatabase;

    #[tokio::test]
    async fn test_ensure_initialized_is_idempotent() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        let history = HistoryStore::default();

        assert!(history.ensure_initialized(&mut conn).await.unwrap());
        assert!(!history.ensure_initialized(&mut conn).await.unwrap());
        assert_eq!(
            db.columns(DEFAULT_HISTORY_TABLE).unwrap(),
            vec!["MigrationId", "AppliedAtUtc"]
        );

        let signature = db.structural_signature(&[]);
        assert!(signature.contains(&format!(
            "column {}.MigrationId TEXT NOT NULL default=none",
            DEFAULT_HISTORY_TABLE
        )));

        let long_id = format!("20230101000000_{}", "X".repeat(200));
        history.record_applied(&mut conn, &long_id).await.unwrap();
        assert!(history.is_applied(&mut conn, &long_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_table_means_nothing_applied() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        let history = HistoryStore::new("custom_history");

        assert!(history.applied(&mut conn).await.unwrap().is_empty());
        assert!(!history.is_applied(&mut conn, "x").await.unwrap());
        assert!(db.columns("custom_history").is_none());
    }

    #[tokio::test]
    async fn test_record_and_revert() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        let history = HistoryStore::default();
        history.ensure_initialized(&mut conn).await.unwrap();

        history.record_applied(&mut conn, "20220101000000_a").await.unwrap();
        history.record_applied(&mut conn, "20220102000000_b").await.unwrap();

        let records = history.applied(&mut conn).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].migration_id, "20220101000000_a");
        assert!(records[0].applied_at <= records[1].applied_at);

        let err = history
            .record_applied(&mut conn, "20220101000000_a")
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::DuplicateApplication(_)));

        history.record_reverted(&mut conn, "20220102000000_b").await.unwrap();
        let err = history
            .record_reverted(&mut conn, "20220102000000_b")
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::NotApplied(_)));
        assert_eq!(
            history.applied_ids(&mut conn).await.unwrap(),
            vec!["20220101000000_a"]
        );
    }
}
