//! PostgreSQL driver.

mod dialect;

pub use dialect::{literal, quote_ident, PostgresDialect};

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, Connection as _, Row as _, TypeInfo};
use tracing::{debug, warn};

use strata_core::config::DatabaseConfig;
use strata_core::error::{Result, StrataError};
use strata_core::schema::Value;

use super::{Connection, Row, StatementBuilder};

/// A single PostgreSQL session.
///
/// Advisory locks belong to the session, so the runner keeps one physical
/// connection for a whole run instead of checking connections out of a pool.
pub struct PostgresConnection {
    conn: PgConnection,
    dialect: PostgresDialect,
}

impl PostgresConnection {
    /// Open a session from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| StrataError::Config(format!("Invalid database URL: {}", e)))?;

        let conn = tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_secs),
            PgConnection::connect_with(&options),
        )
        .await
        .map_err(|_| {
            StrataError::Database(format!(
                "Timed out connecting after {}s",
                config.connect_timeout_secs
            ))
        })?
        .map_err(|e| StrataError::Database(format!("Failed to connect: {}", e)))?;

        let mut this = Self {
            conn,
            dialect: PostgresDialect::new(),
        };

        if config.statement_timeout_secs > 0 {
            let sql = format!(
                "SET statement_timeout = '{}s'",
                config.statement_timeout_secs
            );
            this.execute(&sql).await?;
        }

        debug!("Connected to PostgreSQL");
        Ok(this)
    }

    /// Close the session gracefully.
    pub async fn close(self) -> Result<()> {
        self.conn
            .close()
            .await
            .map_err(|e| StrataError::Database(format!("Failed to close connection: {}", e)))
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn dialect(&self) -> &dyn StatementBuilder {
        &self.dialect
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.execute("BEGIN").await.map(|_| ())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let result = sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(sql))
            .await
            .map_err(|e| StrataError::Database(format!("{} (statement: {})", e, sql)))?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<Row>> {
        let rows = sqlx::query(sql)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| StrataError::Database(format!("{} (query: {})", e, sql)))?;

        rows.iter().map(decode_row).collect()
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    async fn try_acquire_lock(&mut self, name: &str) -> Result<bool> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(name)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| {
                StrataError::Database(format!("Failed to acquire lock '{}': {}", name, e))
            })?;
        Ok(acquired)
    }

    async fn release_lock(&mut self, name: &str) -> Result<()> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(name)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| {
                StrataError::Database(format!("Failed to release lock '{}': {}", name, e))
            })?;
        if !released {
            warn!("Advisory lock '{}' was not held by this session", name);
        }
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(&mut self.conn)
        .await?;
        Ok(exists)
    }

    async fn table_columns(&mut self, table: &str) -> Result<Option<Vec<String>>> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }

        let columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::text FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&mut self.conn)
        .await?;
        Ok(Some(columns))
    }
}

fn decode_row(row: &PgRow) -> Result<Row> {
    row.columns()
        .iter()
        .map(|col| {
            let idx = col.ordinal();
            let type_name = col.type_info().name().to_string();
            let value = match type_name.as_str() {
                "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => row
                    .try_get::<Option<String>, _>(idx)?
                    .map_or(Value::Null, Value::Text),
                "BOOL" => row
                    .try_get::<Option<bool>, _>(idx)?
                    .map_or(Value::Null, Value::Bool),
                "INT2" => row
                    .try_get::<Option<i16>, _>(idx)?
                    .map_or(Value::Null, |v| Value::Int(v as i64)),
                "INT4" => row
                    .try_get::<Option<i32>, _>(idx)?
                    .map_or(Value::Null, |v| Value::Int(v as i64)),
                "INT8" => row
                    .try_get::<Option<i64>, _>(idx)?
                    .map_or(Value::Null, Value::Int),
                "FLOAT4" => row
                    .try_get::<Option<f32>, _>(idx)?
                    .map_or(Value::Null, |v| Value::Float(v as f64)),
                "FLOAT8" => row
                    .try_get::<Option<f64>, _>(idx)?
                    .map_or(Value::Null, Value::Float),
                "TIMESTAMPTZ" => row
                    .try_get::<Option<DateTime<Utc>>, _>(idx)?
                    .map_or(Value::Null, Value::Timestamp),
                "TIMESTAMP" => row
                    .try_get::<Option<NaiveDateTime>, _>(idx)?
                    .map_or(Value::Null, |v| Value::Timestamp(v.and_utc())),
                other => {
                    return Err(StrataError::Database(format!(
                        "Unsupported column type {} for {}",
                        other,
                        col.name()
                    )))
                }
            };
            Ok(value)
        })
        .collect()
}
