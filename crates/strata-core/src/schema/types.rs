use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StrataError;

/// Column types understood by the operation model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    /// UUID type
    Uuid,
    /// Variable-length string with optional max length
    Varchar(Option<u32>),
    /// Unlimited text
    Text,
    /// 16-bit integer
    SmallInt,
    /// 32-bit integer
    Integer,
    /// 64-bit integer
    BigInt,
    /// 32-bit floating point
    Real,
    /// 64-bit floating point
    DoublePrecision,
    /// Decimal with precision and scale
    Decimal(u8, u8),
    /// Boolean
    Boolean,
    /// Timestamp with timezone
    Timestamptz,
    /// Date without time
    Date,
    /// JSONB for structured data
    Jsonb,
    /// Byte array
    Bytea,
    /// Anything else, passed through verbatim
    Custom(String),
}

impl ColumnType {
    /// Generate the SQL type declaration.
    pub fn to_sql(&self) -> String {
        match self {
            ColumnType::Uuid => "UUID".to_string(),
            ColumnType::Varchar(None) => "VARCHAR".to_string(),
            ColumnType::Varchar(Some(len)) => format!("VARCHAR({})", len),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::SmallInt => "SMALLINT".to_string(),
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Real => "REAL".to_string(),
            ColumnType::DoublePrecision => "DOUBLE PRECISION".to_string(),
            ColumnType::Decimal(p, s) => format!("DECIMAL({}, {})", p, s),
            ColumnType::Boolean => "BOOLEAN".to_string(),
            ColumnType::Timestamptz => "TIMESTAMPTZ".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Jsonb => "JSONB".to_string(),
            ColumnType::Bytea => "BYTEA".to_string(),
            ColumnType::Custom(name) => name.clone(),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

impl FromStr for ColumnType {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(StrataError::InvalidArgument("empty column type".into()));
        }

        let lower = raw.to_ascii_lowercase();
        let (base, args) = match lower.find('(') {
            Some(open) if lower.ends_with(')') => (
                lower[..open].trim().to_string(),
                Some(lower[open + 1..lower.len() - 1].to_string()),
            ),
            _ => (lower.clone(), None),
        };

        let ty = match (base.as_str(), args) {
            ("uuid", None) => ColumnType::Uuid,
            ("varchar" | "character varying" | "nvarchar", None) => ColumnType::Varchar(None),
            ("varchar" | "character varying" | "nvarchar", Some(len)) if len.trim() == "max" => {
                ColumnType::Varchar(None)
            }
            ("varchar" | "character varying" | "nvarchar", Some(len)) => {
                let len = len.trim().parse::<u32>().map_err(|_| {
                    StrataError::InvalidArgument(format!("invalid varchar length in '{}'", raw))
                })?;
                ColumnType::Varchar(Some(len))
            }
            ("text", None) => ColumnType::Text,
            ("smallint" | "int2", None) => ColumnType::SmallInt,
            ("int" | "integer" | "int4", None) => ColumnType::Integer,
            ("bigint" | "int8", None) => ColumnType::BigInt,
            ("real" | "float4", None) => ColumnType::Real,
            ("double precision" | "float8" | "float", None) => ColumnType::DoublePrecision,
            ("decimal" | "numeric", Some(args)) => {
                let parts: Vec<&str> = args.split(',').map(|p| p.trim()).collect();
                match parts.as_slice() {
                    [p, s] => match (p.parse::<u8>(), s.parse::<u8>()) {
                        (Ok(p), Ok(s)) => ColumnType::Decimal(p, s),
                        _ => {
                            return Err(StrataError::InvalidArgument(format!(
                                "invalid decimal precision in '{}'",
                                raw
                            )))
                        }
                    },
                    _ => {
                        return Err(StrataError::InvalidArgument(format!(
                            "decimal needs precision and scale: '{}'",
                            raw
                        )))
                    }
                }
            }
            ("boolean" | "bool" | "bit", None) => ColumnType::Boolean,
            ("timestamptz" | "timestamp with time zone" | "datetimeoffset", None) => {
                ColumnType::Timestamptz
            }
            ("date", None) => ColumnType::Date,
            ("jsonb" | "json", None) => ColumnType::Jsonb,
            ("bytea", None) => ColumnType::Bytea,
            _ => ColumnType::Custom(raw.to_string()),
        };

        Ok(ty)
    }
}

impl TryFrom<String> for ColumnType {
    type Error = StrataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_sql()
    }
}

/// A literal used for defaults, seed rows and key lookups.
///
/// Deserialization is untagged: TOML and JSON scalars map onto the
/// variants in declaration order, so timestamps read from files arrive as
/// `Text` and are coerced by the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Read a timestamp, accepting RFC 3339 text.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Text(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Timestamp(ts) => write!(f, "'{}'", ts.to_rfc3339()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_to_sql() {
        assert_eq!(ColumnType::Uuid.to_sql(), "UUID");
        assert_eq!(ColumnType::Varchar(Some(100)).to_sql(), "VARCHAR(100)");
        assert_eq!(ColumnType::Decimal(10, 2).to_sql(), "DECIMAL(10, 2)");
    }

    #[test]
    fn test_column_type_parsing() {
        assert_eq!("int".parse::<ColumnType>().unwrap(), ColumnType::Integer);
        assert_eq!(
            "nvarchar(max)".parse::<ColumnType>().unwrap(),
            ColumnType::Varchar(None)
        );
        assert_eq!(
            "VARCHAR(256)".parse::<ColumnType>().unwrap(),
            ColumnType::Varchar(Some(256))
        );
        assert_eq!(
            "numeric(8, 2)".parse::<ColumnType>().unwrap(),
            ColumnType::Decimal(8, 2)
        );
        assert_eq!(
            "datetimeoffset".parse::<ColumnType>().unwrap(),
            ColumnType::Timestamptz
        );
        assert_eq!(
            "geography".parse::<ColumnType>().unwrap(),
            ColumnType::Custom("geography".into())
        );
        assert!("varchar(abc)".parse::<ColumnType>().is_err());
        assert!("".parse::<ColumnType>().is_err());
    }

    #[test]
    fn test_value_untagged_json() {
        let values: Vec<Value> = serde_json::from_str(r#"[null, true, 3, 2.5, "x"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Int(3),
                Value::Float(2.5),
                Value::Text("x".into())
            ]
        );
    }

    #[test]
    fn test_value_timestamp_from_text() {
        let v = Value::Text("2024-03-01T10:00:00Z".into());
        let ts = v.as_timestamp().unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert!(Value::Int(1).as_timestamp().is_none());
    }
}
