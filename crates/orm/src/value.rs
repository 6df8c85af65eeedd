//! Database values and rows
//!
//! `DatabaseValue` is the scalar exchanged with the execution adapter, both as
//! bound parameters and as column values in result rows.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value as JsonValue;

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Date(chrono::NaiveDate),
    Json(JsonValue),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int32(i) => Some(*i as i64),
            DatabaseValue::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// String form used for tagged ids; `None` for values that cannot be keys
    pub fn to_key_string(&self) -> Option<String> {
        match self {
            DatabaseValue::Int32(i) => Some(i.to_string()),
            DatabaseValue::Int64(i) => Some(i.to_string()),
            DatabaseValue::String(s) if !s.is_empty() => Some(s.clone()),
            DatabaseValue::Uuid(u) => Some(u.to_string()),
            _ => None,
        }
    }

    /// SQL-style comparison with integer/float coercion; `None` when the
    /// values are not comparable (including any NULL)
    pub fn compare(&self, other: &DatabaseValue) -> Option<Ordering> {
        use DatabaseValue::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Bool(a), Bool(b)) => a.partial_cmp(b),
            (String(a), String(b)) => a.partial_cmp(b),
            (Uuid(a), Uuid(b)) => a.partial_cmp(b),
            (Uuid(a), String(b)) => a.to_string().as_str().partial_cmp(b.as_str()),
            (String(a), Uuid(b)) => a.as_str().partial_cmp(b.to_string().as_str()),
            (DateTime(a), DateTime(b)) => a.partial_cmp(b),
            (Date(a), Date(b)) => a.partial_cmp(b),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => match (self.as_i64(), other.as_i64()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => a.partial_cmp(&b),
                },
                _ => None,
            },
        }
    }

    /// SQL-style equality (`=`), NULL never matches
    pub fn sql_eq(&self, other: &DatabaseValue) -> bool {
        match (self, other) {
            (DatabaseValue::Json(a), DatabaseValue::Json(b)) => a == b,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            DatabaseValue::Int32(i) => Some(*i as f64),
            DatabaseValue::Int64(i) => Some(*i as f64),
            DatabaseValue::Float64(f) => Some(*f),
            _ => None,
        }
    }

    /// Convert to JSON value
    pub fn to_json(&self) -> JsonValue {
        match self {
            DatabaseValue::Null => JsonValue::Null,
            DatabaseValue::Bool(b) => JsonValue::Bool(*b),
            DatabaseValue::Int32(i) => JsonValue::Number(serde_json::Number::from(*i)),
            DatabaseValue::Int64(i) => JsonValue::Number(serde_json::Number::from(*i)),
            DatabaseValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DatabaseValue::String(s) => JsonValue::String(s.clone()),
            DatabaseValue::Uuid(u) => JsonValue::String(u.to_string()),
            DatabaseValue::DateTime(dt) => JsonValue::String(dt.to_rfc3339()),
            DatabaseValue::Date(d) => JsonValue::String(d.to_string()),
            DatabaseValue::Json(j) => j.clone(),
        }
    }

    /// Create a DatabaseValue from a JSON scalar; objects and arrays stay JSON
    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => DatabaseValue::Null,
            JsonValue::Bool(b) => DatabaseValue::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DatabaseValue::Int64(i)
                } else if let Some(f) = n.as_f64() {
                    DatabaseValue::Float64(f)
                } else {
                    DatabaseValue::Null
                }
            }
            JsonValue::String(s) => DatabaseValue::String(s),
            other => DatabaseValue::Json(other),
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<uuid::Uuid> for DatabaseValue {
    fn from(value: uuid::Uuid) -> Self {
        DatabaseValue::Uuid(value)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DatabaseValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl From<chrono::NaiveDate> for DatabaseValue {
    fn from(value: chrono::NaiveDate) -> Self {
        DatabaseValue::Date(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// A result row: column name to value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: HashMap<String, DatabaseValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column<T: Into<DatabaseValue>>(mut self, name: &str, value: T) -> Self {
        self.columns.insert(name.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: DatabaseValue) {
        self.columns.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&DatabaseValue> {
        self.columns.get(name)
    }

    /// Missing columns read as NULL
    pub fn get_or_null(&self, name: &str) -> DatabaseValue {
        self.columns.get(name).cloned().unwrap_or(DatabaseValue::Null)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.columns
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, DatabaseValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, DatabaseValue)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}
