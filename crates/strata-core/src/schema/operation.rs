use serde::{Deserialize, Serialize};

use super::types::{ColumnType, Value};
use crate::error::{Result, StrataError};

/// Definition of a column inside `CreateTable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,

    /// Column type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,

    /// Whether the column accepts NULL.
    #[serde(default = "default_true")]
    pub nullable: bool,

    /// Default value for new rows.
    #[serde(default)]
    pub default: Option<Value>,
}

impl ColumnDef {
    /// Create a nullable column without a default.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Primary key declared on `CreateTable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyDef {
    pub name: String,
    pub columns: Vec<String>,
}

/// Foreign key declared on `CreateTable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub name: String,
    pub column: String,
    pub principal_table: String,
    pub principal_column: String,
    #[serde(default)]
    pub on_delete: ReferentialAction,
}

/// What happens to dependent rows when the principal row is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    pub fn to_sql(self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// One atomic schema or data change.
///
/// The set of variants is closed: every change a migration can make is one
/// of these, and each maps onto statements through a dialect's
/// `StatementBuilder`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    AddColumn {
        table: String,
        column: String,
        #[serde(rename = "type")]
        column_type: ColumnType,
        #[serde(default = "default_true")]
        nullable: bool,
        #[serde(default)]
        default: Option<Value>,
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
    AlterColumn {
        table: String,
        column: String,
        new_type: ColumnType,
        old_type: ColumnType,
        nullable: bool,
        /// Nullability before the change. Assumed NOT NULL when omitted.
        #[serde(default)]
        old_nullable: bool,
        /// Backfill value for existing NULLs; also becomes the column default.
        /// An explicit null drops the column default.
        #[serde(default)]
        default: Option<Value>,
    },
    CreateTable {
        name: String,
        columns: Vec<ColumnDef>,
        #[serde(default)]
        primary_key: Option<PrimaryKeyDef>,
        #[serde(default)]
        foreign_keys: Vec<ForeignKeyDef>,
    },
    DropTable {
        name: String,
    },
    AddIndex {
        table: String,
        columns: Vec<String>,
        #[serde(default)]
        unique: bool,
        /// Explicit index name; derived as `IX_<table>_<columns>` otherwise.
        #[serde(default)]
        name: Option<String>,
    },
    DropIndex {
        name: String,
        table: String,
    },
    AddForeignKey {
        name: String,
        table: String,
        column: String,
        principal_table: String,
        principal_column: String,
        #[serde(default)]
        on_delete: ReferentialAction,
    },
    DropForeignKey {
        name: String,
        table: String,
    },
    AddPrimaryKey {
        name: String,
        table: String,
        columns: Vec<String>,
    },
    DropPrimaryKey {
        name: String,
        table: String,
    },
    InsertRow {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    UpdateRow {
        table: String,
        key_column: String,
        key_value: Value,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    DeleteRow {
        table: String,
        key_column: String,
        key_value: Value,
    },
    /// Executed verbatim. Reversibility is the script author's problem.
    RawStatement {
        sql: String,
    },
}

impl Operation {
    /// The table this operation touches, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            Operation::AddColumn { table, .. }
            | Operation::DropColumn { table, .. }
            | Operation::RenameColumn { table, .. }
            | Operation::AlterColumn { table, .. }
            | Operation::AddIndex { table, .. }
            | Operation::DropIndex { table, .. }
            | Operation::AddForeignKey { table, .. }
            | Operation::DropForeignKey { table, .. }
            | Operation::AddPrimaryKey { table, .. }
            | Operation::DropPrimaryKey { table, .. }
            | Operation::InsertRow { table, .. }
            | Operation::UpdateRow { table, .. }
            | Operation::DeleteRow { table, .. } => Some(table),
            Operation::CreateTable { name, .. } | Operation::DropTable { name } => Some(name),
            Operation::RawStatement { .. } => None,
        }
    }

    /// Short operation kind, as used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::AddColumn { .. } => "add_column",
            Operation::DropColumn { .. } => "drop_column",
            Operation::RenameColumn { .. } => "rename_column",
            Operation::AlterColumn { .. } => "alter_column",
            Operation::CreateTable { .. } => "create_table",
            Operation::DropTable { .. } => "drop_table",
            Operation::AddIndex { .. } => "add_index",
            Operation::DropIndex { .. } => "drop_index",
            Operation::AddForeignKey { .. } => "add_foreign_key",
            Operation::DropForeignKey { .. } => "drop_foreign_key",
            Operation::AddPrimaryKey { .. } => "add_primary_key",
            Operation::DropPrimaryKey { .. } => "drop_primary_key",
            Operation::InsertRow { .. } => "insert_row",
            Operation::UpdateRow { .. } => "update_row",
            Operation::DeleteRow { .. } => "delete_row",
            Operation::RawStatement { .. } => "raw_statement",
        }
    }

    /// Human-readable one-line description.
    pub fn describe(&self) -> String {
        match self {
            Operation::AddColumn {
                table,
                column,
                column_type,
                nullable,
                ..
            } => format!(
                "Add column {}.{} {}{}",
                table,
                column,
                column_type,
                if *nullable { "" } else { " NOT NULL" }
            ),
            Operation::DropColumn { table, column } => format!("Drop column {}.{}", table, column),
            Operation::RenameColumn { table, from, to } => {
                format!("Rename column {}.{} to {}", table, from, to)
            }
            Operation::AlterColumn {
                table,
                column,
                old_type,
                new_type,
                nullable,
                ..
            } => format!(
                "Alter column {}.{} from {} to {}{}",
                table,
                column,
                old_type,
                new_type,
                if *nullable { "" } else { " NOT NULL" }
            ),
            Operation::CreateTable { name, columns, .. } => {
                format!("Create table {} ({} columns)", name, columns.len())
            }
            Operation::DropTable { name } => format!("Drop table {}", name),
            Operation::AddIndex {
                table,
                columns,
                unique,
                ..
            } => format!(
                "Add {}index {} on {}({})",
                if *unique { "unique " } else { "" },
                self.index_name().unwrap_or_default(),
                table,
                columns.join(", ")
            ),
            Operation::DropIndex { name, table } => format!("Drop index {} on {}", name, table),
            Operation::AddForeignKey {
                name,
                table,
                column,
                principal_table,
                principal_column,
                ..
            } => format!(
                "Add foreign key {} {}.{} -> {}.{}",
                name, table, column, principal_table, principal_column
            ),
            Operation::DropForeignKey { name, table } => {
                format!("Drop foreign key {} on {}", name, table)
            }
            Operation::AddPrimaryKey {
                name,
                table,
                columns,
            } => format!(
                "Add primary key {} on {}({})",
                name,
                table,
                columns.join(", ")
            ),
            Operation::DropPrimaryKey { name, table } => {
                format!("Drop primary key {} on {}", name, table)
            }
            Operation::InsertRow { table, .. } => format!("Insert row into {}", table),
            Operation::UpdateRow {
                table,
                key_column,
                key_value,
                ..
            } => format!("Update row in {} where {} = {}", table, key_column, key_value),
            Operation::DeleteRow {
                table,
                key_column,
                key_value,
            } => format!(
                "Delete row from {} where {} = {}",
                table, key_column, key_value
            ),
            Operation::RawStatement { sql } => {
                let first = sql.lines().next().unwrap_or_default().trim();
                format!("Raw statement: {}", first)
            }
        }
    }

    /// Name of the index created by `AddIndex`.
    pub fn index_name(&self) -> Option<String> {
        match self {
            Operation::AddIndex {
                table,
                columns,
                name,
                ..
            } => Some(
                name.clone()
                    .unwrap_or_else(|| format!("IX_{}_{}", table, columns.join("_"))),
            ),
            Operation::DropIndex { name, .. } => Some(name.clone()),
            _ => None,
        }
    }

    /// Checks that need no database.
    pub fn validate(&self) -> Result<()> {
        if let Some(table) = self.table() {
            require_ident("table", table)?;
        }

        match self {
            Operation::AddColumn {
                column,
                nullable,
                default,
                table,
                ..
            } => {
                require_ident("column", column)?;
                if !nullable && default.as_ref().map_or(true, Value::is_null) {
                    return Err(StrataError::UnsafeAlter {
                        table: table.clone(),
                        column: column.clone(),
                    });
                }
            }
            Operation::DropColumn { column, .. } => require_ident("column", column)?,
            Operation::RenameColumn { from, to, .. } => {
                require_ident("column", from)?;
                require_ident("column", to)?;
                if from == to {
                    return Err(StrataError::InvalidArgument(format!(
                        "rename of column {} to itself",
                        from
                    )));
                }
            }
            Operation::AlterColumn {
                table,
                column,
                nullable,
                old_nullable,
                default,
                ..
            } => {
                require_ident("column", column)?;
                let narrowing = *old_nullable && !*nullable;
                if narrowing && default.as_ref().map_or(true, Value::is_null) {
                    return Err(StrataError::UnsafeAlter {
                        table: table.clone(),
                        column: column.clone(),
                    });
                }
            }
            Operation::CreateTable {
                name,
                columns,
                primary_key,
                foreign_keys,
            } => {
                if columns.is_empty() {
                    return Err(StrataError::InvalidArgument(format!(
                        "table {} has no columns",
                        name
                    )));
                }
                let mut seen = std::collections::HashSet::new();
                for col in columns {
                    require_ident("column", &col.name)?;
                    if !seen.insert(col.name.as_str()) {
                        return Err(StrataError::InvalidArgument(format!(
                            "table {} declares column {} twice",
                            name, col.name
                        )));
                    }
                }
                let declared = |c: &str| columns.iter().any(|col| col.name == c);
                if let Some(pk) = primary_key {
                    require_ident("primary key", &pk.name)?;
                    if let Some(missing) = pk.columns.iter().find(|c| !declared(c)) {
                        return Err(StrataError::InvalidArgument(format!(
                            "primary key {} references unknown column {}",
                            pk.name, missing
                        )));
                    }
                }
                for fk in foreign_keys {
                    require_ident("foreign key", &fk.name)?;
                    if !declared(&fk.column) {
                        return Err(StrataError::InvalidArgument(format!(
                            "foreign key {} references unknown column {}",
                            fk.name, fk.column
                        )));
                    }
                }
            }
            Operation::AddIndex { columns, .. } | Operation::AddPrimaryKey { columns, .. } => {
                if columns.is_empty() {
                    return Err(StrataError::InvalidArgument(format!(
                        "{} needs at least one column",
                        self.kind()
                    )));
                }
            }
            Operation::DropIndex { name, .. }
            | Operation::DropForeignKey { name, .. }
            | Operation::DropPrimaryKey { name, .. } => require_ident("name", name)?,
            Operation::AddForeignKey {
                name,
                column,
                principal_table,
                principal_column,
                ..
            } => {
                require_ident("name", name)?;
                require_ident("column", column)?;
                require_ident("principal table", principal_table)?;
                require_ident("principal column", principal_column)?;
            }
            Operation::InsertRow { columns, values, .. }
            | Operation::UpdateRow { columns, values, .. } => {
                if columns.is_empty() || columns.len() != values.len() {
                    return Err(StrataError::InvalidArgument(format!(
                        "{} has {} columns but {} values",
                        self.kind(),
                        columns.len(),
                        values.len()
                    )));
                }
            }
            Operation::DeleteRow { key_column, .. } => require_ident("key column", key_column)?,
            Operation::RawStatement { sql } => {
                if sql.trim().is_empty() {
                    return Err(StrataError::InvalidArgument("empty raw statement".into()));
                }
            }
            Operation::DropTable { .. } => {}
        }

        Ok(())
    }
}

fn require_ident(what: &str, ident: &str) -> Result<()> {
    if ident.trim().is_empty() {
        return Err(StrataError::InvalidArgument(format!("empty {} name", what)));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}
