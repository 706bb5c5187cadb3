//! Statement binder: SQL text plus positional parameters into a bound,
//! ready-to-step prepared statement.

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, Statement, ToSql};

use crate::error::{engine_message, AccessError, Result};
use crate::value::Value;

/// A parameter that passed validation.
enum Bindable<'a> {
    Integer(i64),
    Real(f64),
    Text(&'a str),
}

impl<'a> Bindable<'a> {
    fn from_value(index: usize, value: &'a Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(Bindable::Integer(*i)),
            Value::Real(r) => Ok(Bindable::Real(*r)),
            Value::Text(text) => Ok(Bindable::Text(text)),
            Value::Null => Err(AccessError::UnsupportedParameterType {
                index,
                kind: value.kind(),
            }),
        }
    }
}

impl ToSql for Bindable<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            Bindable::Integer(i) => ValueRef::Integer(*i),
            Bindable::Real(r) => ValueRef::Real(*r),
            // Bound with an explicit length and SQLITE_TRANSIENT: the engine keeps its own copy.
            Bindable::Text(text) => ValueRef::Text(text.as_bytes()),
        };
        Ok(ToSqlOutput::Borrowed(value))
    }
}

/// Compile `sql` on `conn`. Nothing runs until the statement is stepped.
pub fn prepare<'conn>(conn: &'conn Connection, sql: &str) -> rusqlite::Result<Statement<'conn>> {
    conn.prepare(sql)
}

/// Bind `parameters` to the placeholders of `statement`.
///
/// Count and types are validated before anything is bound, so a rejected
/// call leaves the statement as it was prepared.
pub fn bind(statement: &mut Statement<'_>, parameters: Option<&[Value]>) -> Result<()> {
    let required = statement.parameter_count();
    let parameters = match parameters {
        Some(parameters) => parameters,
        None if required > 0 => return Err(AccessError::MissingParameters { required }),
        None => return Ok(()),
    };
    if parameters.len() != required {
        return Err(AccessError::ParameterCountMismatch {
            required,
            provided: parameters.len(),
        });
    }
    let bindables = parameters
        .iter()
        .enumerate()
        .map(|(index, value)| Bindable::from_value(index, value))
        .collect::<Result<Vec<_>>>()?;

    for (index, bindable) in bindables.iter().enumerate() {
        // SQLite placeholders are 1-based.
        statement
            .raw_bind_parameter(index + 1, bindable)
            .map_err(|err| AccessError::ParameterBindFailed {
                index,
                message: engine_message(&err),
            })?;
    }
    Ok(())
}
