use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Core value type for SQLite parameters and decoded columns.
///
/// Parameters are always one of the non-null variants; decoded rows may
/// contain `Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// The variant of a [`Value`], used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Integer,
    Real,
    Text,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Integer => "integer",
            ValueKind::Real => "real",
            ValueKind::Text => "text",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Integer(_) => ValueKind::Integer,
            Value::Real(_) => ValueKind::Real,
            Value::Text(_) => ValueKind::Text,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Reals as-is; integers widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Real(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// One statement execution: SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub sql: String,
    pub parameters: Option<Vec<Value>>,
}

impl Task {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: None,
        }
    }

    pub fn with_parameters<I, V>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.parameters = Some(parameters.into_iter().map(Into::into).collect());
        self
    }

    /// Append a single positional parameter.
    pub fn with_parameter(mut self, value: impl Into<Value>) -> Self {
        self.parameters
            .get_or_insert_with(Vec::new)
            .push(value.into());
        self
    }

    pub fn parameters(&self) -> Option<&[Value]> {
        self.parameters.as_deref()
    }
}

/// A decoded result row.
///
/// Columns keep the order the engine reported them in. A repeated column
/// name keeps its first position and takes the later value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    columns: IndexMap<String, Value>,
}

impl Row {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: IndexMap::with_capacity(capacity),
        }
    }

    pub(crate) fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.columns.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.columns.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::default();
        for (column, value) in iter {
            row.insert(column, value.into());
        }
        row
    }
}

/// Outcome of a single statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionResult {
    /// Rows produced by a statement that returns columns.
    RowSet(Vec<Row>),
    /// Rows changed by a write statement.
    AffectedCount(u64),
}

impl ExecutionResult {
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            ExecutionResult::RowSet(rows) => Some(rows),
            ExecutionResult::AffectedCount(_) => None,
        }
    }

    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            ExecutionResult::RowSet(rows) => Some(rows),
            ExecutionResult::AffectedCount(_) => None,
        }
    }

    pub fn affected(&self) -> Option<u64> {
        match self {
            ExecutionResult::AffectedCount(count) => Some(*count),
            ExecutionResult::RowSet(_) => None,
        }
    }
}
