//! In-memory database for tests.
//!
//! Models just enough of a relational store to exercise the engine end to
//! end: tables, columns, keys, indexes, rows, transactions and advisory
//! locks. Statements produced by [`MemoryDialect`] are JSON documents;
//! anything else is treated as opaque raw SQL and only logged.
//!
//! Connections share one catalog. Uncommitted changes are visible to other
//! connections, which is fine for a single-runner test but not a model of
//! isolation.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strata_core::error::{Result, StrataError};
use strata_core::schema::{
    ColumnDef, ColumnType, ForeignKeyDef, Operation, PrimaryKeyDef, ReferentialAction, Value,
};

use crate::driver::{Connection, Row, StatementBuilder};

/// A row keyed by column name.
pub type MemoryRow = BTreeMap<String, Value>;

/// Shared in-memory database. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    catalog: Catalog,
    locks: HashMap<String, u64>,
    log: Vec<String>,
    failures: Vec<String>,
    next_connection_id: u64,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session.
    pub fn connect(&self) -> MemoryConnection {
        let id = {
            let mut state = lock(&self.state);
            state.next_connection_id += 1;
            state.next_connection_id
        };
        MemoryConnection {
            id,
            state: Arc::clone(&self.state),
            snapshot: None,
            dialect: MemoryDialect,
        }
    }

    /// Make every statement containing `pattern` fail.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        lock(&self.state).failures.push(pattern.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    /// Every statement executed so far, including failed ones.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.state).log.clone()
    }

    pub fn table_names(&self) -> Vec<String> {
        lock(&self.state).catalog.tables.keys().cloned().collect()
    }

    /// Column names of `table` in declaration order.
    pub fn columns(&self, table: &str) -> Option<Vec<String>> {
        lock(&self.state)
            .catalog
            .tables
            .get(table)
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
    }

    pub fn rows(&self, table: &str) -> Vec<MemoryRow> {
        lock(&self.state)
            .catalog
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        lock(&self.state).locks.contains_key(name)
    }

    /// Sorted description of tables, columns, keys and indexes, skipping
    /// the named tables. Row data is not part of the signature.
    pub fn structural_signature(&self, skip_tables: &[&str]) -> Vec<String> {
        let state = lock(&self.state);
        let mut lines = BTreeSet::new();

        for (name, table) in &state.catalog.tables {
            if skip_tables.contains(&name.as_str()) {
                continue;
            }
            lines.insert(format!("table {}", name));
            for col in &table.columns {
                lines.insert(format!(
                    "column {}.{} {} {} default={}",
                    name,
                    col.name,
                    col.column_type,
                    if col.nullable { "NULL" } else { "NOT NULL" },
                    col.default
                        .as_ref()
                        .map_or_else(|| "none".to_string(), |v| v.to_string())
                ));
            }
            if let Some(pk) = &table.primary_key {
                lines.insert(format!(
                    "pk {}.{} ({})",
                    name,
                    pk.name,
                    pk.columns.join(", ")
                ));
            }
            for (idx_name, idx) in &table.indexes {
                lines.insert(format!(
                    "index {}.{} ({}){}",
                    name,
                    idx_name,
                    idx.columns.join(", "),
                    if idx.unique { " unique" } else { "" }
                ));
            }
            for (fk_name, fk) in &table.foreign_keys {
                lines.insert(format!(
                    "fk {}.{} {} -> {}.{} on delete {}",
                    name,
                    fk_name,
                    fk.column,
                    fk.principal_table,
                    fk.principal_column,
                    fk.on_delete.to_sql()
                ));
            }
        }

        lines.into_iter().collect()
    }
}

/// One session against a [`MemoryDatabase`].
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
    snapshot: Option<Catalog>,
    dialect: MemoryDialect,
}

impl MemoryConnection {
    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(snapshot) = self.snapshot.take() {
            state.catalog = snapshot;
        }
        let id = self.id;
        state.locks.retain(|_, owner| *owner != id);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn dialect(&self) -> &dyn StatementBuilder {
        &self.dialect
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Err(StrataError::Database(
                "there is already a transaction in progress".into(),
            ));
        }
        self.snapshot = Some(lock(&self.state).catalog.clone());
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let mut state = lock(&self.state);
        state.log.push(sql.to_string());

        if let Some(pattern) = state.failures.iter().find(|p| sql.contains(p.as_str())) {
            return Err(StrataError::Database(format!(
                "injected failure on '{}'",
                pattern
            )));
        }

        match parse_statement(sql)? {
            Some(stmt) => state.catalog.apply(stmt),
            None => {
                debug!("memory database ignoring raw statement: {}", sql);
                Ok(0)
            }
        }
    }

    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<Row>> {
        let state = lock(&self.state);
        match parse_statement(sql)? {
            Some(MemoryStatement::Select {
                table,
                columns,
                filter,
                order_by,
            }) => state.catalog.select(&table, &columns, filter.as_ref(), &order_by),
            _ => Err(StrataError::Database(format!(
                "memory database cannot query: {}",
                sql
            ))),
        }
    }

    async fn commit(&mut self) -> Result<()> {
        match self.snapshot.take() {
            Some(_) => Ok(()),
            None => Err(StrataError::Database("no transaction in progress".into())),
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.snapshot.take() {
            Some(snapshot) => {
                lock(&self.state).catalog = snapshot;
                Ok(())
            }
            None => Err(StrataError::Database("no transaction in progress".into())),
        }
    }

    async fn try_acquire_lock(&mut self, name: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        match state.locks.get(name) {
            Some(owner) if *owner != self.id => Ok(false),
            _ => {
                state.locks.insert(name.to_string(), self.id);
                Ok(true)
            }
        }
    }

    async fn release_lock(&mut self, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        match state.locks.get(name) {
            Some(owner) if *owner == self.id => {
                state.locks.remove(name);
            }
            _ => warn!("Advisory lock '{}' was not held by this session", name),
        }
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(lock(&self.state).catalog.tables.contains_key(table))
    }

    async fn table_columns(&mut self, table: &str) -> Result<Option<Vec<String>>> {
        Ok(lock(&self.state)
            .catalog
            .tables
            .get(table)
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect()))
    }
}

fn parse_statement(sql: &str) -> Result<Option<MemoryStatement>> {
    if !sql.trim_start().starts_with('{') {
        return Ok(None);
    }
    serde_json::from_str(sql)
        .map(Some)
        .map_err(|e| StrataError::Database(format!("malformed memory statement: {}", e)))
}

/// Statement language of the in-memory database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stmt", rename_all = "snake_case")]
enum MemoryStatement {
    CreateTable {
        name: String,
        columns: Vec<ColumnDef>,
        primary_key: Option<PrimaryKeyDef>,
        foreign_keys: Vec<ForeignKeyDef>,
    },
    DropTable {
        name: String,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    DropColumn {
        table: String,
        column: String,
    },
    RenameColumn {
        table: String,
        from: String,
        to: String,
    },
    Backfill {
        table: String,
        column: String,
        value: Value,
    },
    AlterColumn {
        table: String,
        column: String,
        column_type: ColumnType,
        nullable: bool,
        default: Option<Value>,
    },
    CreateIndex {
        table: String,
        name: String,
        columns: Vec<String>,
        unique: bool,
    },
    DropIndex {
        table: String,
        name: String,
    },
    AddForeignKey {
        table: String,
        foreign_key: ForeignKeyDef,
    },
    DropForeignKey {
        table: String,
        name: String,
    },
    AddPrimaryKey {
        table: String,
        primary_key: PrimaryKeyDef,
    },
    DropPrimaryKey {
        table: String,
        name: String,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    Update {
        table: String,
        key_column: String,
        key_value: Value,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    Delete {
        table: String,
        key_column: String,
        key_value: Value,
    },
    Select {
        table: String,
        columns: Vec<String>,
        filter: Option<(String, Value)>,
        order_by: Vec<String>,
    },
}

/// Statement builder for [`MemoryDatabase`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryDialect;

impl MemoryDialect {
    fn encode(stmt: &MemoryStatement) -> Result<String> {
        Ok(serde_json::to_string(stmt)?)
    }
}

impl StatementBuilder for MemoryDialect {
    fn build(&self, operation: &Operation) -> Result<Vec<String>> {
        let stmts = match operation {
            Operation::AddColumn {
                table,
                column,
                column_type,
                nullable,
                default,
            } => vec![MemoryStatement::AddColumn {
                table: table.clone(),
                column: ColumnDef {
                    name: column.clone(),
                    column_type: column_type.clone(),
                    nullable: *nullable,
                    default: default.clone(),
                },
            }],
            Operation::DropColumn { table, column } => vec![MemoryStatement::DropColumn {
                table: table.clone(),
                column: column.clone(),
            }],
            Operation::RenameColumn { table, from, to } => vec![MemoryStatement::RenameColumn {
                table: table.clone(),
                from: from.clone(),
                to: to.clone(),
            }],
            Operation::AlterColumn {
                table,
                column,
                new_type,
                nullable,
                default,
                ..
            } => {
                let mut stmts = Vec::new();
                if let Some(value) = default.as_ref().filter(|v| !v.is_null()) {
                    if !*nullable {
                        stmts.push(MemoryStatement::Backfill {
                            table: table.clone(),
                            column: column.clone(),
                            value: value.clone(),
                        });
                    }
                }
                stmts.push(MemoryStatement::AlterColumn {
                    table: table.clone(),
                    column: column.clone(),
                    column_type: new_type.clone(),
                    nullable: *nullable,
                    default: default.clone(),
                });
                stmts
            }
            Operation::CreateTable {
                name,
                columns,
                primary_key,
                foreign_keys,
            } => vec![MemoryStatement::CreateTable {
                name: name.clone(),
                columns: columns.clone(),
                primary_key: primary_key.clone(),
                foreign_keys: foreign_keys.clone(),
            }],
            Operation::DropTable { name } => vec![MemoryStatement::DropTable { name: name.clone() }],
            Operation::AddIndex {
                table,
                columns,
                unique,
                ..
            } => vec![MemoryStatement::CreateIndex {
                table: table.clone(),
                name: operation.index_name().unwrap_or_default(),
                columns: columns.clone(),
                unique: *unique,
            }],
            Operation::DropIndex { name, table } => vec![MemoryStatement::DropIndex {
                table: table.clone(),
                name: name.clone(),
            }],
            Operation::AddForeignKey {
                name,
                table,
                column,
                principal_table,
                principal_column,
                on_delete,
            } => vec![MemoryStatement::AddForeignKey {
                table: table.clone(),
                foreign_key: ForeignKeyDef {
                    name: name.clone(),
                    column: column.clone(),
                    principal_table: principal_table.clone(),
                    principal_column: principal_column.clone(),
                    on_delete: *on_delete,
                },
            }],
            Operation::DropForeignKey { name, table } => vec![MemoryStatement::DropForeignKey {
                table: table.clone(),
                name: name.clone(),
            }],
            Operation::AddPrimaryKey {
                name,
                table,
                columns,
            } => vec![MemoryStatement::AddPrimaryKey {
                table: table.clone(),
                primary_key: PrimaryKeyDef {
                    name: name.clone(),
                    columns: columns.clone(),
                },
            }],
            Operation::DropPrimaryKey { name, table } => vec![MemoryStatement::DropPrimaryKey {
                table: table.clone(),
                name: name.clone(),
            }],
            Operation::InsertRow {
                table,
                columns,
                values,
            } => vec![MemoryStatement::Insert {
                table: table.clone(),
                columns: columns.clone(),
                values: values.clone(),
            }],
            Operation::UpdateRow {
                table,
                key_column,
                key_value,
                columns,
                values,
            } => vec![MemoryStatement::Update {
                table: table.clone(),
                key_column: key_column.clone(),
                key_value: key_value.clone(),
                columns: columns.clone(),
                values: values.clone(),
            }],
            Operation::DeleteRow {
                table,
                key_column,
                key_value,
            } => vec![MemoryStatement::Delete {
                table: table.clone(),
                key_column: key_column.clone(),
                key_value: key_value.clone(),
            }],
            Operation::RawStatement { sql } => return Ok(vec![sql.clone()]),
        };

        stmts.iter().map(Self::encode).collect()
    }

    fn select(
        &self,
        table: &str,
        columns: &[&str],
        filter: Option<(&str, &Value)>,
        order_by: &[&str],
    ) -> Result<String> {
        Self::encode(&MemoryStatement::Select {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            filter: filter.map(|(c, v)| (c.to_string(), v.clone())),
            order_by: order_by.iter().map(|c| c.to_string()).collect(),
        })
    }
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    tables: BTreeMap<String, Table>,
}

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<ColumnDef>,
    primary_key: Option<PrimaryKeyDef>,
    indexes: BTreeMap<String, Index>,
    foreign_keys: BTreeMap<String, ForeignKey>,
    rows: Vec<MemoryRow>,
}

#[derive(Debug, Clone)]
struct Index {
    columns: Vec<String>,
    unique: bool,
}

#[derive(Debug, Clone)]
struct ForeignKey {
    column: String,
    principal_table: String,
    principal_column: String,
    on_delete: ReferentialAction,
}

impl From<&ForeignKeyDef> for ForeignKey {
    fn from(fk: &ForeignKeyDef) -> Self {
        Self {
            column: fk.column.clone(),
            principal_table: fk.principal_table.clone(),
            principal_column: fk.principal_column.clone(),
            on_delete: fk.on_delete,
        }
    }
}

static NULL: Value = Value::Null;

fn db_err(msg: impl Into<String>) -> StrataError {
    StrataError::Database(msg.into())
}

impl Table {
    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    fn column_mut(&mut self, table: &str, name: &str) -> Result<&mut ColumnDef> {
        self.columns
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| db_err(format!("column \"{}\" of relation \"{}\" does not exist", name, table)))
    }

    fn require_columns(&self, table: &str, columns: &[String]) -> Result<()> {
        match columns.iter().find(|c| !self.has_column(c)) {
            Some(missing) => Err(db_err(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                missing, table
            ))),
            None => Ok(()),
        }
    }

    /// Fail if two rows share the same non-null key over `columns`.
    fn check_unique(&self, name: &str, columns: &[String]) -> Result<()> {
        let mut seen: Vec<Vec<&Value>> = Vec::new();
        for row in &self.rows {
            let key: Vec<&Value> = columns
                .iter()
                .map(|c| row.get(c).unwrap_or(&NULL))
                .collect();
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            if seen.iter().any(|k| keys_equal(k, &key)) {
                return Err(db_err(format!(
                    "duplicate key value violates unique constraint \"{}\"",
                    name
                )));
            }
            seen.push(key);
        }
        Ok(())
    }

    fn check_constraints(&self) -> Result<()> {
        for col in self.columns.iter().filter(|c| !c.nullable) {
            if self
                .rows
                .iter()
                .any(|r| r.get(&col.name).map_or(true, Value::is_null))
            {
                return Err(db_err(format!(
                    "null value in column \"{}\" violates not-null constraint",
                    col.name
                )));
            }
        }
        if let Some(pk) = &self.primary_key {
            self.check_unique(&pk.name, &pk.columns)?;
        }
        for (name, idx) in self.indexes.iter().filter(|(_, i)| i.unique) {
            self.check_unique(name, &idx.columns)?;
        }
        Ok(())
    }
}

impl Catalog {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| db_err(format!("relation \"{}\" does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| db_err(format!("relation \"{}\" does not exist", name)))
    }

    fn index_exists(&self, name: &str) -> bool {
        self.tables.values().any(|t| t.indexes.contains_key(name))
    }

    /// Referencing foreign keys from other tables onto `table` (and `column`, if given).
    fn dependents(&self, table: &str, column: Option<&str>) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(name, _)| name.as_str() != table)
            .flat_map(|(_, t)| t.foreign_keys.iter())
            .filter(|(_, fk)| {
                fk.principal_table == table && column.map_or(true, |c| fk.principal_column == c)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn check_principal(&self, fk: &ForeignKeyDef, own: Option<&[ColumnDef]>) -> Result<()> {
        let has_column = match (own, self.tables.get(&fk.principal_table)) {
            (Some(columns), _) => columns.iter().any(|c| c.name == fk.principal_column),
            (_, Some(table)) => table.has_column(&fk.principal_column),
            (_, None) => {
                return Err(db_err(format!(
                    "relation \"{}\" does not exist",
                    fk.principal_table
                )))
            }
        };
        if !has_column {
            return Err(db_err(format!(
                "column \"{}\" referenced in foreign key constraint \"{}\" does not exist",
                fk.principal_column, fk.name
            )));
        }
        Ok(())
    }

    fn apply(&mut self, stmt: MemoryStatement) -> Result<u64> {
        match stmt {
            MemoryStatement::CreateTable {
                name,
                columns,
                primary_key,
                foreign_keys,
            } => {
                if self.tables.contains_key(&name) {
                    return Err(db_err(format!("relation \"{}\" already exists", name)));
                }
                for fk in &foreign_keys {
                    let own = (fk.principal_table == name).then_some(columns.as_slice());
                    self.check_principal(fk, own)?;
                }
                let table = Table {
                    columns,
                    primary_key,
                    indexes: BTreeMap::new(),
                    foreign_keys: foreign_keys
                        .iter()
                        .map(|fk| (fk.name.clone(), ForeignKey::from(fk)))
                        .collect(),
                    rows: Vec::new(),
                };
                self.tables.insert(name, table);
                Ok(0)
            }
            MemoryStatement::DropTable { name } => {
                self.table(&name)?;
                if let Some(dep) = self.dependents(&name, None).first() {
                    return Err(db_err(format!(
                        "cannot drop table \"{}\" because constraint \"{}\" depends on it",
                        name, dep
                    )));
                }
                self.tables.remove(&name);
                Ok(0)
            }
            MemoryStatement::AddColumn { table, column } => {
                let t = self.table_mut(&table)?;
                if t.has_column(&column.name) {
                    return Err(db_err(format!(
                        "column \"{}\" of relation \"{}\" already exists",
                        column.name, table
                    )));
                }
                let fill = column.default.clone().unwrap_or(Value::Null);
                if !column.nullable && fill.is_null() && !t.rows.is_empty() {
                    return Err(db_err(format!(
                        "column \"{}\" of relation \"{}\" contains null values",
                        column.name, table
                    )));
                }
                for row in &mut t.rows {
                    row.insert(column.name.clone(), fill.clone());
                }
                t.columns.push(column);
                Ok(0)
            }
            MemoryStatement::DropColumn { table, column } => {
                if let Some(dep) = self.dependents(&table, Some(column.as_str())).first() {
                    return Err(db_err(format!(
                        "cannot drop column \"{}\" because constraint \"{}\" depends on it",
                        column, dep
                    )));
                }
                let t = self.table_mut(&table)?;
                if !t.has_column(&column) {
                    return Err(db_err(format!(
                        "column \"{}\" of relation \"{}\" does not exist",
                        column, table
                    )));
                }
                t.columns.retain(|c| c.name != column);
                for row in &mut t.rows {
                    row.remove(&column);
                }
                t.indexes.retain(|_, idx| !idx.columns.contains(&column));
                t.foreign_keys.retain(|_, fk| fk.column != column);
                if t
                    .primary_key
                    .as_ref()
                    .is_some_and(|pk| pk.columns.contains(&column))
                {
                    t.primary_key = None;
                }
                Ok(0)
            }
            MemoryStatement::RenameColumn { table, from, to } => {
                {
                    let t = self.table_mut(&table)?;
                    if t.has_column(&to) {
                        return Err(db_err(format!(
                            "column \"{}\" of relation \"{}\" already exists",
                            to, table
                        )));
                    }
                    t.column_mut(&table, &from)?.name = to.clone();
                    let rename = |c: &mut String| {
                        if *c == from {
                            *c = to.clone();
                        }
                    };
                    for row in &mut t.rows {
                        if let Some(v) = row.remove(&from) {
                            row.insert(to.clone(), v);
                        }
                    }
                    t.indexes
                        .values_mut()
                        .for_each(|idx| idx.columns.iter_mut().for_each(rename));
                    if let Some(pk) = &mut t.primary_key {
                        pk.columns.iter_mut().for_each(rename);
                    }
                    t.foreign_keys
                        .values_mut()
                        .for_each(|fk| rename(&mut fk.column));
                }
                for fk in self.tables.values_mut().flat_map(|t| t.foreign_keys.values_mut()) {
                    if fk.principal_table == table && fk.principal_column == from {
                        fk.principal_column = to.clone();
                    }
                }
                Ok(0)
            }
            MemoryStatement::Backfill {
                table,
                column,
                value,
            } => {
                let t = self.table_mut(&table)?;
                t.column_mut(&table, &column)?;
                let mut updated = 0;
                for row in &mut t.rows {
                    let slot = row.entry(column.clone()).or_insert(Value::Null);
                    if slot.is_null() {
                        *slot = value.clone();
                        updated += 1;
                    }
                }
                Ok(updated)
            }
            MemoryStatement::AlterColumn {
                table,
                column,
                column_type,
                nullable,
                default,
            } => {
                let t = self.table_mut(&table)?;
                if !nullable
                    && t
                        .rows
                        .iter()
                        .any(|r| r.get(&column).map_or(true, Value::is_null))
                {
                    return Err(db_err(format!(
                        "column \"{}\" of relation \"{}\" contains null values",
                        column, table
                    )));
                }
                let col = t.column_mut(&table, &column)?;
                col.column_type = column_type;
                col.nullable = nullable;
                match default {
                    Some(Value::Null) => col.default = None,
                    Some(v) => col.default = Some(v),
                    None => {}
                }
                Ok(0)
            }
            MemoryStatement::CreateIndex {
                table,
                name,
                columns,
                unique,
            } => {
                if self.index_exists(&name) {
                    return Err(db_err(format!("relation \"{}\" already exists", name)));
                }
                let t = self.table_mut(&table)?;
                t.require_columns(&table, &columns)?;
                if unique {
                    t.check_unique(&name, &columns)?;
                }
                t.indexes.insert(name, Index { columns, unique });
                Ok(0)
            }
            MemoryStatement::DropIndex { table, name } => {
                // Index names are global, like a schema-scoped index in PostgreSQL.
                let owner = if self.table(&table)?.indexes.contains_key(&name) {
                    Some(table)
                } else {
                    self.tables
                        .iter()
                        .find(|(_, t)| t.indexes.contains_key(&name))
                        .map(|(n, _)| n.clone())
                };
                match owner {
                    Some(owner) => {
                        self.table_mut(&owner)?.indexes.remove(&name);
                        Ok(0)
                    }
                    None => Err(db_err(format!("index \"{}\" does not exist", name))),
                }
            }
            MemoryStatement::AddForeignKey { table, foreign_key } => {
                self.check_principal(&foreign_key, None)?;
                let t = self.table_mut(&table)?;
                t.require_columns(&table, std::slice::from_ref(&foreign_key.column))?;
                if t.foreign_keys.contains_key(&foreign_key.name) {
                    return Err(db_err(format!(
                        "constraint \"{}\" for relation \"{}\" already exists",
                        foreign_key.name, table
                    )));
                }
                t.foreign_keys
                    .insert(foreign_key.name.clone(), ForeignKey::from(&foreign_key));
                Ok(0)
            }
            MemoryStatement::DropForeignKey { table, name } => {
                match self.table_mut(&table)?.foreign_keys.remove(&name) {
                    Some(_) => Ok(0),
                    None => Err(db_err(format!(
                        "constraint \"{}\" of relation \"{}\" does not exist",
                        name, table
                    ))),
                }
            }
            MemoryStatement::AddPrimaryKey { table, primary_key } => {
                let t = self.table_mut(&table)?;
                if t.primary_key.is_some() {
                    return Err(db_err(format!(
                        "multiple primary keys for table \"{}\" are not allowed",
                        table
                    )));
                }
                t.require_columns(&table, &primary_key.columns)?;
                if t.rows.iter().any(|r| {
                    primary_key
                        .columns
                        .iter()
                        .any(|c| r.get(c).map_or(true, Value::is_null))
                }) {
                    return Err(db_err(format!(
                        "column of relation \"{}\" contains null values",
                        table
                    )));
                }
                t.check_unique(&primary_key.name, &primary_key.columns)?;
                t.primary_key = Some(primary_key);
                Ok(0)
            }
            MemoryStatement::DropPrimaryKey { table, name } => {
                let t = self.table_mut(&table)?;
                match &t.primary_key {
                    Some(pk) if pk.name == name => {
                        t.primary_key = None;
                        Ok(0)
                    }
                    _ => Err(db_err(format!(
                        "constraint \"{}\" of relation \"{}\" does not exist",
                        name, table
                    ))),
                }
            }
            MemoryStatement::Insert {
                table,
                columns,
                values,
            } => {
                let t = self.table_mut(&table)?;
                t.require_columns(&table, &columns)?;
                let mut row = MemoryRow::new();
                for col in &t.columns {
                    let value = match columns.iter().position(|c| *c == col.name) {
                        Some(pos) => values.get(pos).cloned().unwrap_or(Value::Null),
                        None => col.default.clone().unwrap_or(Value::Null),
                    };
                    row.insert(col.name.clone(), value);
                }
                t.rows.push(row);
                if let Err(e) = t.check_constraints() {
                    t.rows.pop();
                    return Err(e);
                }
                Ok(1)
            }
            MemoryStatement::Update {
                table,
                key_column,
                key_value,
                columns,
                values,
            } => {
                let t = self.table_mut(&table)?;
                t.require_columns(&table, &columns)?;
                t.require_columns(&table, std::slice::from_ref(&key_column))?;
                let before = t.rows.clone();
                let mut updated = 0;
                for row in t.rows.iter_mut().filter(|r| {
                    r.get(&key_column)
                        .is_some_and(|v| values_equal(v, &key_value))
                }) {
                    for (c, v) in columns.iter().zip(&values) {
                        row.insert(c.clone(), v.clone());
                    }
                    updated += 1;
                }
                if let Err(e) = t.check_constraints() {
                    t.rows = before;
                    return Err(e);
                }
                Ok(updated)
            }
            MemoryStatement::Delete {
                table,
                key_column,
                key_value,
            } => {
                let t = self.table_mut(&table)?;
                t.require_columns(&table, std::slice::from_ref(&key_column))?;
                let before = t.rows.len();
                t.rows.retain(|r| {
                    !r.get(&key_column)
                        .is_some_and(|v| values_equal(v, &key_value))
                });
                Ok((before - t.rows.len()) as u64)
            }
            MemoryStatement::Select { .. } => {
                Err(db_err("use fetch_all for queries"))
            }
        }
    }

    fn select(
        &self,
        table: &str,
        columns: &[String],
        filter: Option<&(String, Value)>,
        order_by: &[String],
    ) -> Result<Vec<Row>> {
        let t = self.table(table)?;
        t.require_columns(table, columns)?;
        t.require_columns(table, order_by)?;

        let mut rows: Vec<&MemoryRow> = t
            .rows
            .iter()
            .filter(|r| match filter {
                Some((column, value)) => r.get(column).is_some_and(|v| values_equal(v, value)),
                None => true,
            })
            .collect();

        rows.sort_by(|a, b| {
            order_by
                .iter()
                .map(|c| compare_values(a.get(c).unwrap_or(&NULL), b.get(c).unwrap_or(&NULL)))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });

        Ok(rows
            .into_iter()
            .map(|r| {
                columns
                    .iter()
                    .map(|c| r.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect())
    }
}

/// SQL equality: NULL equals nothing.
fn values_equal(a: &Value, b: &Value) -> bool {
    !a.is_null() && !b.is_null() && compare_values(a, b) == Ordering::Equal
}

fn keys_equal(a: &[&Value], b: &[&Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
}

/// Total order used for sorting; NULLs sort first.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).total_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.total_cmp(&(*y as f64)),
        (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
        (Value::Text(x), Value::Text(y)) => match (a.as_timestamp(), b.as_timestamp()) {
            (Some(ta), Some(tb)) => ta.cmp(&tb),
            _ => x.cmp(y),
        },
        _ => match (a.as_timestamp(), b.as_timestamp()) {
            (Some(ta), Some(tb)) => ta.cmp(&tb),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(conn: &mut MemoryConnection, op: Operation) -> Result<()> {
        for stmt in conn.dialect().build(&op)? {
            conn.execute(&stmt).await?;
        }
        Ok(())
    }

    fn users_table() -> Operation {
        Operation::CreateTable {
            name: "Users".into(),
            columns: vec![
                ColumnDef::new("Id", ColumnType::Integer).not_null(),
                ColumnDef::new("Name", ColumnType::Text),
            ],
            primary_key: Some(PrimaryKeyDef {
                name: "PK_Users".into(),
                columns: vec!["Id".into()],
            }),
            foreign_keys: vec![],
        }
    }

    fn insert_user(id: i64, name: &str) -> Operation {
        Operation::InsertRow {
            table: "Users".into(),
            columns: vec!["Id".into(), "Name".into()],
            values: vec![Value::Int(id), name.into()],
        }
    }

    #[tokio::test]
    async fn test_rollback_restores_catalog() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();

        conn.begin_transaction().await.unwrap();
        run(&mut conn, users_table()).await.unwrap();
        assert!(db.columns("Users").is_some());
        conn.rollback().await.unwrap();

        assert!(db.columns("Users").is_none());
        assert!(!conn.in_transaction());
    }

    #[tokio::test]
    async fn test_primary_key_rejects_duplicates() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        run(&mut conn, users_table()).await.unwrap();
        run(&mut conn, insert_user(1, "ann")).await.unwrap();

        let err = run(&mut conn, insert_user(1, "bob")).await.unwrap_err();
        assert!(err.to_string().contains("PK_Users"));
        assert_eq!(db.rows("Users").len(), 1);
    }

    #[tokio::test]
    async fn test_select_filters_and_orders() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        run(&mut conn, users_table()).await.unwrap();
        run(&mut conn, insert_user(2, "bob")).await.unwrap();
        run(&mut conn, insert_user(1, "ann")).await.unwrap();

        let sql = MemoryDialect.select("Users", &["Name"], None, &["Id"]).unwrap();
        let rows = conn.fetch_all(&sql).await.unwrap();
        assert_eq!(rows, vec![vec![Value::from("ann")], vec![Value::from("bob")]]);

        let sql = MemoryDialect
            .select("Users", &["Id"], Some(("Name", &Value::from("bob"))), &[])
            .unwrap();
        assert_eq!(conn.fetch_all(&sql).await.unwrap(), vec![vec![Value::Int(2)]]);
    }

    #[tokio::test]
    async fn test_locks_are_exclusive_across_sessions() {
        let db = MemoryDatabase::new();
        let mut first = db.connect();
        let mut second = db.connect();

        assert!(first.try_acquire_lock("migrate").await.unwrap());
        assert!(first.try_acquire_lock("migrate").await.unwrap());
        assert!(!second.try_acquire_lock("migrate").await.unwrap());

        drop(first);
        assert!(!db.is_locked("migrate"));
        assert!(second.try_acquire_lock("migrate").await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_table_blocked_by_dependent_foreign_key() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        run(&mut conn, users_table()).await.unwrap();
        run(
            &mut conn,
            Operation::CreateTable {
                name: "Events".into(),
                columns: vec![
                    ColumnDef::new("Id", ColumnType::Integer).not_null(),
                    ColumnDef::new("CreatedByUserId", ColumnType::Integer),
                ],
                primary_key: None,
                foreign_keys: vec![ForeignKeyDef {
                    name: "FK_Events_Users".into(),
                    column: "CreatedByUserId".into(),
                    principal_table: "Users".into(),
                    principal_column: "Id".into(),
                    on_delete: ReferentialAction::Restrict,
                }],
            },
        )
        .await
        .unwrap();

        let err = run(&mut conn, Operation::DropTable { name: "Users".into() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("FK_Events_Users"));
    }

    #[tokio::test]
    async fn test_injected_failure_and_raw_passthrough() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        db.fail_on("explode");

        assert_eq!(conn.execute("UPDATE x SET y = 1").await.unwrap(), 0);
        assert!(conn.execute("SELECT explode()").await.is_err());
        assert_eq!(db.statements().len(), 2);
    }

    #[test]
    fn test_compare_values_timestamps_as_text() {
        let a = Value::Text("2024-01-01T10:00:00+00:00".into());
        let b = Value::Text("2024-01-01T09:00:00-02:00".into());
        assert_eq!(compare_values(&a, &b), Ordering::Less);
        assert_eq!(compare_values(&Value::Null, &a), Ordering::Less);
        assert!(!values_equal(&Value::Null, &Value::Null));
    }
}
