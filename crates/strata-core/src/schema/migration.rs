use serde::{Deserialize, Serialize};

use super::operation::Operation;
use crate::error::{Result, StrataError};

/// Ordered list of operations. Order matters: an index must be dropped
/// before the column it covers, a table created before keys referencing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationSet(Vec<Operation>);

impl OperationSet {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self(operations)
    }

    pub fn push(&mut self, operation: Operation) {
        self.0.push(operation);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Validate every operation, reporting the first failure with its position.
    pub fn validate(&self) -> Result<()> {
        for (idx, op) in self.0.iter().enumerate() {
            op.validate().map_err(|e| match e {
                StrataError::InvalidArgument(msg) => {
                    StrataError::InvalidArgument(format!("operation #{}: {}", idx + 1, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

impl From<Vec<Operation>> for OperationSet {
    fn from(operations: Vec<Operation>) -> Self {
        Self(operations)
    }
}

impl FromIterator<Operation> for OperationSet {
    fn from_iter<T: IntoIterator<Item = Operation>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a OperationSet {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A single reversible migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationScript {
    id: String,
    /// Forward operations.
    pub up: OperationSet,
    /// Inverse of `up`.
    pub down: OperationSet,
}

impl MigrationScript {
    pub fn new(
        id: impl Into<String>,
        up: impl Into<OperationSet>,
        down: impl Into<OperationSet>,
    ) -> Self {
        Self {
            id: id.into(),
            up: up.into(),
            down: down.into(),
        }
    }

    /// Unique identifier (e.g., "20230301120000_AddEventCoLeads").
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The part of the id after the timestamp prefix.
    pub fn name(&self) -> &str {
        match self.id.split_once('_') {
            Some((prefix, name)) if is_timestamp(prefix) => name,
            _ => &self.id,
        }
    }

    /// Whether the id follows `YYYYMMDDHHMMSS_name`.
    pub fn follows_id_convention(&self) -> bool {
        match self.id.split_once('_') {
            Some((prefix, name)) => {
                is_timestamp(prefix)
                    && !name.is_empty()
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        }
    }

    /// Static checks over both directions.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StrataError::InvalidArgument("empty migration id".into()));
        }
        self.up
            .validate()
            .map_err(|e| StrataError::in_migration(&self.id, e))?;
        self.down
            .validate()
            .map_err(|e| StrataError::in_migration(&self.id, e))?;
        Ok(())
    }
}

fn is_timestamp(prefix: &str) -> bool {
    prefix.len() == 14 && prefix.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, Value};

    #[test]
    fn test_id_convention() {
        let ok = MigrationScript::new(
            "20230301120000_AddEventCoLeads",
            OperationSet::default(),
            OperationSet::default(),
        );
        assert!(ok.follows_id_convention());
        assert_eq!(ok.name(), "AddEventCoLeads");

        let short = MigrationScript::new("0001_init", OperationSet::default(), OperationSet::default());
        assert!(!short.follows_id_convention());
        assert_eq!(short.name(), "0001_init");
    }

    #[test]
    fn test_validate_wraps_with_migration_id() {
        let script = MigrationScript::new(
            "20230301120000_Narrow",
            vec![Operation::AlterColumn {
                table: "Events".into(),
                column: "MaxParticipants".into(),
                new_type: ColumnType::Integer,
                old_type: ColumnType::Integer,
                nullable: false,
                old_nullable: true,
                default: None,
            }],
            OperationSet::default(),
        );

        let err = script.validate().unwrap_err();
        assert_eq!(err.migration_id(), Some("20230301120000_Narrow"));
        assert!(matches!(err.root(), StrataError::UnsafeAlter { .. }));
    }

    #[test]
    fn test_operation_set_reports_position() {
        let set = OperationSet::new(vec![
            Operation::RawStatement {
                sql: "SELECT 1".into(),
            },
            Operation::InsertRow {
                table: "T".into(),
                columns: vec!["A".into()],
                values: vec![Value::Int(1), Value::Int(2)],
            },
        ]);

        let err = set.validate().unwrap_err();
        assert!(err.to_string().contains("operation #2"));
    }
}
