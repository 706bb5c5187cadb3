//! Row decoder: engine rows into [`Row`] values.

use rusqlite::types::ValueRef;
use rusqlite::Statement;

use crate::value::{Row, Value};

/// Column names of `statement`, in engine order. Read these before stepping.
pub fn column_names(statement: &Statement<'_>) -> Vec<String> {
    statement
        .column_names()
        .into_iter()
        .map(String::from)
        .collect()
}

/// Decode the current row using the engine-reported type of each column.
///
/// Numbers come from the native accessors, never from their text form.
/// Anything that is not integer, real or null decodes as text.
pub fn decode_row(row: &rusqlite::Row<'_>, columns: &[String]) -> rusqlite::Result<Row> {
    let mut decoded = Row::with_capacity(columns.len());
    for (index, name) in columns.iter().enumerate() {
        let value = match row.get_ref(index)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        };
        decoded.insert(name.as_str(), value);
    }
    Ok(decoded)
}
