use strata_core::error::Result;
use strata_core::schema::{ColumnDef, ForeignKeyDef, Operation, Value};

use crate::driver::StatementBuilder;

/// PostgreSQL statement builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    pub fn new() -> Self {
        Self
    }

    fn column_sql(col: &ColumnDef) -> String {
        let mut sql = format!("{} {}", quote_ident(&col.name), col.column_type.to_sql());
        if !col.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &col.default {
            sql.push_str(&format!(" DEFAULT {}", literal(default)));
        }
        sql
    }

    fn foreign_key_sql(fk: &ForeignKeyDef) -> String {
        format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
            quote_ident(&fk.name),
            quote_ident(&fk.column),
            quote_ident(&fk.principal_table),
            quote_ident(&fk.principal_column),
            fk.on_delete.to_sql()
        )
    }
}

impl StatementBuilder for PostgresDialect {
    fn build(&self, operation: &Operation) -> Result<Vec<String>> {
        let statements = match operation {
            Operation::AddColumn {
                table,
                column,
                column_type,
                nullable,
                default,
            } => {
                let col = ColumnDef {
                    name: column.clone(),
                    column_type: column_type.clone(),
                    nullable: *nullable,
                    default: default.clone(),
                };
                vec![format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    quote_ident(table),
                    Self::column_sql(&col)
                )]
            }
            Operation::DropColumn { table, column } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            )],
            Operation::RenameColumn { table, from, to } => vec![format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote_ident(table),
                quote_ident(from),
                quote_ident(to)
            )],
            Operation::AlterColumn {
                table,
                column,
                new_type,
                old_type,
                nullable,
                old_nullable,
                default,
            } => {
                let table = quote_ident(table);
                let column = quote_ident(column);
                let mut stmts = Vec::new();

                if new_type != old_type {
                    stmts.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                        table,
                        column,
                        new_type.to_sql(),
                        column,
                        new_type.to_sql()
                    ));
                }
                match default {
                    Some(Value::Null) => stmts.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                        table, column
                    )),
                    Some(default) => {
                        if !*nullable {
                            stmts.push(format!(
                                "UPDATE {} SET {} = {} WHERE {} IS NULL",
                                table,
                                column,
                                literal(default),
                                column
                            ));
                        }
                        stmts.push(format!(
                            "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                            table,
                            column,
                            literal(default)
                        ));
                    }
                    None => {}
                }
                if !*nullable {
                    stmts.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
                        table, column
                    ));
                } else if !*old_nullable {
                    stmts.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
                        table, column
                    ));
                }
                stmts
            }
            Operation::CreateTable {
                name,
                columns,
                primary_key,
                foreign_keys,
            } => {
                let mut parts: Vec<String> = columns.iter().map(Self::column_sql).collect();
                if let Some(pk) = primary_key {
                    parts.push(format!(
                        "CONSTRAINT {} PRIMARY KEY ({})",
                        quote_ident(&pk.name),
                        ident_list(&pk.columns)
                    ));
                }
                parts.extend(foreign_keys.iter().map(Self::foreign_key_sql));
                vec![format!(
                    "CREATE TABLE {} (\n    {}\n)",
                    quote_ident(name),
                    parts.join(",\n    ")
                )]
            }
            Operation::DropTable { name } => vec![format!("DROP TABLE {}", quote_ident(name))],
            Operation::AddIndex {
                table,
                columns,
                unique,
                ..
            } => {
                let name = operation.index_name().unwrap_or_default();
                vec![format!(
                    "CREATE {}INDEX {} ON {} ({})",
                    if *unique { "UNIQUE " } else { "" },
                    quote_ident(&name),
                    quote_ident(table),
                    ident_list(columns)
                )]
            }
            // Index names are schema-scoped in PostgreSQL.
            Operation::DropIndex { name, .. } => vec![format!("DROP INDEX {}", quote_ident(name))],
            Operation::AddForeignKey {
                name,
                table,
                column,
                principal_table,
                principal_column,
                on_delete,
            } => {
                let fk = ForeignKeyDef {
                    name: name.clone(),
                    column: column.clone(),
                    principal_table: principal_table.clone(),
                    principal_column: principal_column.clone(),
                    on_delete: *on_delete,
                };
                vec![format!(
                    "ALTER TABLE {} ADD {}",
                    quote_ident(table),
                    Self::foreign_key_sql(&fk)
                )]
            }
            Operation::DropForeignKey { name, table } | Operation::DropPrimaryKey { name, table } => {
                vec![format!(
                    "ALTER TABLE {} DROP CONSTRAINT {}",
                    quote_ident(table),
                    quote_ident(name)
                )]
            }
            Operation::AddPrimaryKey {
                name,
                table,
                columns,
            } => vec![format!(
                "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                quote_ident(table),
                quote_ident(name),
                ident_list(columns)
            )],
            Operation::InsertRow {
                table,
                columns,
                values,
            } => vec![format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                ident_list(columns),
                values.iter().map(literal).collect::<Vec<_>>().join(", ")
            )],
            Operation::UpdateRow {
                table,
                key_column,
                key_value,
                columns,
                values,
            } => {
                let assignments: Vec<String> = columns
                    .iter()
                    .zip(values)
                    .map(|(c, v)| format!("{} = {}", quote_ident(c), literal(v)))
                    .collect();
                vec![format!(
                    "UPDATE {} SET {} WHERE {}",
                    quote_ident(table),
                    assignments.join(", "),
                    key_predicate(key_column, key_value)
                )]
            }
            Operation::DeleteRow {
                table,
                key_column,
                key_value,
            } => vec![format!(
                "DELETE FROM {} WHERE {}",
                quote_ident(table),
                key_predicate(key_column, key_value)
            )],
            Operation::RawStatement { sql } => vec![sql.clone()],
        };

        Ok(statements)
    }

    fn select(
        &self,
        table: &str,
        columns: &[&str],
        filter: Option<(&str, &Value)>,
        order_by: &[&str],
    ) -> Result<String> {
        let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let mut sql = format!("SELECT {} FROM {}", cols.join(", "), quote_ident(table));
        if let Some((column, value)) = filter {
            sql.push_str(&format!(" WHERE {}", key_predicate(column, value)));
        }
        if !order_by.is_empty() {
            let order: Vec<String> = order_by.iter().map(|c| quote_ident(c)).collect();
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }
        Ok(sql)
    }
}

/// Quote an identifier, preserving case.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn ident_list(idents: &[String]) -> String {
    idents
        .iter()
        .map(|i| quote_ident(i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn key_predicate(column: &str, value: &Value) -> String {
    match value {
        Value::Null => format!("{} IS NULL", quote_ident(column)),
        v => format!("{} = {}", quote_ident(column), literal(v)),
    }
}

/// Render a value as a SQL literal.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Float(f) => format!("'{}'::double precision", f),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Timestamp(ts) => format!("'{}'::timestamptz", ts.to_rfc3339()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::schema::{ColumnType, PrimaryKeyDef, ReferentialAction};

    fn build(op: Operation) -> Vec<String> {
        PostgresDialect::new().build(&op).unwrap()
    }

    #[test]
    fn test_quote_ident_preserves_case_and_escapes() {
        assert_eq!(quote_ident("EventStatuses"), "\"EventStatuses\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_literal_escaping() {
        assert_eq!(literal(&Value::Text("O'Brien".into())), "'O''Brien'");
        assert_eq!(literal(&Value::Bool(true)), "TRUE");
        assert_eq!(literal(&Value::Null), "NULL");
        assert_eq!(literal(&Value::Int(-3)), "-3");
    }

    #[test]
    fn test_create_table_with_keys() {
        let stmts = build(Operation::CreateTable {
            name: "EventPartners".into(),
            columns: vec![
                ColumnDef::new("EventId", ColumnType::Uuid).not_null(),
                ColumnDef::new("PartnerId", ColumnType::Uuid).not_null(),
                ColumnDef::new("StatusId", ColumnType::Integer)
                    .not_null()
                    .default_value(1),
            ],
            primary_key: Some(PrimaryKeyDef {
                name: "PK_EventPartners".into(),
                columns: vec!["EventId".into(), "PartnerId".into()],
            }),
            foreign_keys: vec![ForeignKeyDef {
                name: "FK_EventPartners_Events".into(),
                column: "EventId".into(),
                principal_table: "Events".into(),
                principal_column: "Id".into(),
                on_delete: ReferentialAction::Cascade,
            }],
        });

        assert_eq!(stmts.len(), 1);
        let sql = &stmts[0];
        assert!(sql.starts_with("CREATE TABLE \"EventPartners\""));
        assert!(sql.contains("\"StatusId\" INTEGER NOT NULL DEFAULT 1"));
        assert!(sql.contains("CONSTRAINT \"PK_EventPartners\" PRIMARY KEY (\"EventId\", \"PartnerId\")"));
        assert!(sql.contains("REFERENCES \"Events\" (\"Id\") ON DELETE CASCADE"));
    }

    #[test]
    fn test_alter_column_backfills_before_not_null() {
        let stmts = build(Operation::AlterColumn {
            table: "Events".into(),
            column: "MaxParticipants".into(),
            new_type: ColumnType::Integer,
            old_type: ColumnType::Integer,
            nullable: false,
            old_nullable: true,
            default: Some(Value::Int(0)),
        });

        assert_eq!(
            stmts,
            vec![
                "UPDATE \"Events\" SET \"MaxParticipants\" = 0 WHERE \"MaxParticipants\" IS NULL",
                "ALTER TABLE \"Events\" ALTER COLUMN \"MaxParticipants\" SET DEFAULT 0",
                "ALTER TABLE \"Events\" ALTER COLUMN \"MaxParticipants\" SET NOT NULL",
            ]
        );
    }

    #[test]
    fn test_alter_column_type_and_widen() {
        let stmts = build(Operation::AlterColumn {
            table: "Users".into(),
            column: "City".into(),
            new_type: ColumnType::Varchar(Some(256)),
            old_type: ColumnType::Text,
            nullable: true,
            old_nullable: false,
            default: None,
        });

        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("TYPE VARCHAR(256) USING \"City\"::VARCHAR(256)"));
        assert!(stmts[1].ends_with("DROP NOT NULL"));
    }

    #[test]
    fn test_row_operations() {
        let insert = build(Operation::InsertRow {
            table: "NotificationTypes".into(),
            columns: vec!["Id".into(), "Name".into(), "IsActive".into()],
            values: vec![Value::Int(7), "UpcomingEventAttendingThisWeek".into(), true.into()],
        });
        assert_eq!(
            insert[0],
            "INSERT INTO \"NotificationTypes\" (\"Id\", \"Name\", \"IsActive\") VALUES (7, 'UpcomingEventAttendingThisWeek', TRUE)"
        );

        let update = build(Operation::UpdateRow {
            table: "EventStatuses".into(),
            key_column: "Id".into(),
            key_value: Value::Int(2),
            columns: vec!["Description".into()],
            values: vec!["Event is complete".into()],
        });
        assert_eq!(
            update[0],
            "UPDATE \"EventStatuses\" SET \"Description\" = 'Event is complete' WHERE \"Id\" = 2"
        );

        let delete = build(Operation::DeleteRow {
            table: "EventStatuses".into(),
            key_column: "Id".into(),
            key_value: Value::Int(4),
        });
        assert_eq!(delete[0], "DELETE FROM \"EventStatuses\" WHERE \"Id\" = 4");
    }

    #[test]
    fn test_index_statements() {
        let add = build(Operation::AddIndex {
            table: "Events".into(),
            columns: vec!["EventTypeId".into()],
            unique: false,
            name: None,
        });
        assert_eq!(
            add[0],
            "CREATE INDEX \"IX_Events_EventTypeId\" ON \"Events\" (\"EventTypeId\")"
        );

        let drop = build(Operation::DropIndex {
            name: "IX_Events_EventTypeId".into(),
            table: "Events".into(),
        });
        assert_eq!(drop[0], "DROP INDEX \"IX_Events_EventTypeId\"");
    }

    #[test]
    fn test_select_with_filter_and_order() {
        let sql = PostgresDialect::new()
            .select(
                "__strata_migrations",
                &["MigrationId", "AppliedAtUtc"],
                Some(("MigrationId", &Value::Text("A".into()))),
                &["AppliedAtUtc", "MigrationId"],
            )
            .unwrap();
        assert_eq!(
            sql,
            "SELECT \"MigrationId\", \"AppliedAtUtc\" FROM \"__strata_migrations\" WHERE \"MigrationId\" = 'A' ORDER BY \"AppliedAtUtc\", \"MigrationId\""
        );
    }

    #[test]
    fn test_raw_statement_is_verbatim() {
        let sql = "UPDATE \"Events\" SET \"LeadId\" = \"CreatedByUserId\"";
        assert_eq!(
            build(Operation::RawStatement { sql: sql.into() }),
            vec![sql.to_string()]
        );
    }
}
