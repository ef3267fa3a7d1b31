//! Column types and bind values for dynamically shaped tables.
//!
//! Provider datasets arrive as JSON cells whose shape is only known at run time,
//! so writes go through [`SqlValue`] and a boxed `sql_query` instead of typed
//! Diesel tables. Each column is assigned a [`ColumnType`] either pinned from the
//! catalog (`ts_code` → `VARCHAR(10)`, `trade_date` → `INTEGER`) or inferred from
//! its first non-null value.

use std::{fmt, str::FromStr};

use diesel::{
    query_builder::{BoxedSqlQuery, SqlQuery},
    sql_types::{BigInt, Double, Nullable, Text},
    sqlite::Sqlite,
};
use market_data_ingestor::models::row_set::{value_as_f64, value_as_i64};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A column type string the catalog could not parse.
#[derive(Debug, Error)]
#[error("unsupported column type: {0:?} (expected integer, real, text or varchar(n))")]
pub struct InvalidColumnType(pub String);

/// Declared type of a stored column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    /// Short text with a declared maximum length.
    Varchar(u32),
}

impl ColumnType {
    /// DDL spelling.
    pub fn sql(self) -> String {
        match self {
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::Real => "REAL".to_string(),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Varchar(n) => format!("VARCHAR({n})"),
        }
    }

    /// Maps a declared SQLite type back onto a column type using SQLite's
    /// affinity rules.
    pub fn from_declared(declared: &str) -> ColumnType {
        let upper = declared.trim().to_ascii_uppercase();
        if upper.contains("INT") {
            return ColumnType::Integer;
        }
        if let Some(len) = upper
            .strip_prefix("VARCHAR(")
            .or_else(|| upper.strip_prefix("NVARCHAR("))
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|n| n.trim().parse().ok())
        {
            return ColumnType::Varchar(len);
        }
        if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") || upper.is_empty() {
            return ColumnType::Text;
        }
        ColumnType::Real
    }

    /// Type implied by a single JSON cell; `None` for null.
    pub fn infer(value: &Value) -> Option<ColumnType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Integer),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(ColumnType::Integer),
            Value::Number(_) => Some(ColumnType::Real),
            Value::String(_) | Value::Array(_) | Value::Object(_) => Some(ColumnType::Text),
        }
    }

    fn is_text(self) -> bool {
        matches!(self, ColumnType::Text | ColumnType::Varchar(_))
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql().to_ascii_lowercase())
    }
}

impl FromStr for ColumnType {
    type Err = InvalidColumnType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase();
        match norm.as_str() {
            "integer" | "int" | "bigint" => Ok(ColumnType::Integer),
            "real" | "double" | "float" => Ok(ColumnType::Real),
            "text" => Ok(ColumnType::Text),
            other => other
                .strip_prefix("varchar(")
                .and_then(|rest| rest.strip_suffix(')'))
                .and_then(|n| n.trim().parse::<u32>().ok())
                .filter(|n| *n > 0)
                .map(ColumnType::Varchar)
                .ok_or_else(|| InvalidColumnType(s.to_string())),
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = InvalidColumnType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

/// One bindable SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Converts a JSON cell for storage in a column of type `ty`.
    ///
    /// Integer columns accept numeric strings (`"20100104"` → `20100104`);
    /// fractional values stay real. Text columns render numbers as text.
    pub fn coerce(value: &Value, ty: ColumnType) -> SqlValue {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) if ty.is_text() => SqlValue::Text(b.to_string()),
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Number(n) if ty.is_text() => SqlValue::Text(n.to_string()),
            Value::String(s) if ty.is_text() => SqlValue::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
            Value::Number(_) | Value::String(_) => {
                if ty == ColumnType::Integer {
                    if let Some(i) = value_as_i64(value) {
                        return SqlValue::Integer(i);
                    }
                }
                match value_as_f64(value) {
                    Some(f) => SqlValue::Real(f),
                    None => match value {
                        Value::String(s) => SqlValue::Text(s.clone()),
                        other => SqlValue::Text(other.to_string()),
                    },
                }
            }
        }
    }

    /// Stable rendering used to detect duplicate keys inside one batch.
    pub(crate) fn key_repr(&self) -> String {
        match self {
            SqlValue::Null => "\u{0}null".to_string(),
            SqlValue::Integer(i) => format!("i:{i}"),
            SqlValue::Real(f) => format!("r:{f}"),
            SqlValue::Text(s) => format!("t:{s}"),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

pub(crate) type BoxedQuery<'a> = BoxedSqlQuery<'a, Sqlite, SqlQuery>;

/// Appends `values` as positional binds, in order.
pub(crate) fn bind_all(mut query: BoxedQuery<'_>, values: Vec<SqlValue>) -> BoxedQuery<'_> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind::<Nullable<Text>, _>(None::<String>),
            SqlValue::Integer(i) => query.bind::<BigInt, _>(i),
            SqlValue::Real(f) => query.bind::<Double, _>(f),
            SqlValue::Text(s) => query.bind::<Text, _>(s),
        };
    }
    query
}

/// Quotes an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_catalog_spellings() {
        assert_eq!("INTEGER".parse::<ColumnType>().unwrap(), ColumnType::Integer);
        assert_eq!(" varchar(10) ".parse::<ColumnType>().unwrap(), ColumnType::Varchar(10));
        assert!("varchar(0)".parse::<ColumnType>().is_err());
        assert!("blob".parse::<ColumnType>().is_err());
    }

    #[test]
    fn declared_types_follow_affinity_rules() {
        assert_eq!(ColumnType::from_declared("BIGINT"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("VARCHAR(10)"), ColumnType::Varchar(10));
        assert_eq!(ColumnType::from_declared("NVARCHAR(25)"), ColumnType::Varchar(25));
        assert_eq!(ColumnType::from_declared("TEXT"), ColumnType::Text);
        assert_eq!(ColumnType::from_declared("DOUBLE"), ColumnType::Real);
        assert_eq!(ColumnType::from_declared("NUMERIC"), ColumnType::Real);
    }

    #[test]
    fn coerces_dates_into_integer_columns() {
        assert_eq!(
            SqlValue::coerce(&json!("20100104"), ColumnType::Integer),
            SqlValue::Integer(20100104)
        );
        assert_eq!(SqlValue::coerce(&json!(1.5), ColumnType::Integer), SqlValue::Real(1.5));
        assert_eq!(
            SqlValue::coerce(&json!("n/a"), ColumnType::Integer),
            SqlValue::Text("n/a".into())
        );
        assert_eq!(
            SqlValue::coerce(&json!(600000), ColumnType::Varchar(10)),
            SqlValue::Text("600000".into())
        );
        assert_eq!(SqlValue::coerce(&Value::Null, ColumnType::Real), SqlValue::Null);
    }

    #[test]
    fn quotes_embedded_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
