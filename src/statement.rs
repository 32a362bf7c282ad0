use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params_from_iter, Connection};
use uuid::Uuid;

use crate::error::Result;
use crate::row::Row;
use crate::types::SqlValue;

// ---------------------------------------------------------------------------
// CompiledStatement
// ---------------------------------------------------------------------------

/// SQL text plus its positional bindings, as handed over by a query builder.
/// Immutable once built; the dispatcher hashes it for its registry key and
/// otherwise passes it through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub sql: String,
    pub bindings: Vec<Binding>,
}

impl CompiledStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), bindings: Vec::new() }
    }

    pub fn with_bindings(sql: impl Into<String>, bindings: Vec<Binding>) -> Self {
        Self { sql: sql.into(), bindings }
    }

    /// Append one positional binding.
    pub fn bind(mut self, value: impl Into<Binding>) -> Self {
        self.bindings.push(value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// A typed scalar argument. The derived kinds lower to SQLite's native
/// storage classes before dispatch: booleans to integer 0/1, timestamps to
/// RFC 3339 text with millisecond precision, identifiers to lowercase
/// hyphenated UUID text.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Id(Uuid),
}

impl Binding {
    pub fn lower(&self) -> SqlValue {
        match self {
            Binding::Null => SqlValue::Null,
            Binding::Integer(i) => SqlValue::Integer(*i),
            Binding::Real(r) => SqlValue::Real(*r),
            Binding::Text(t) => SqlValue::Text(t.clone()),
            Binding::Blob(b) => SqlValue::Blob(b.clone()),
            Binding::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Binding::Timestamp(ts) => {
                SqlValue::Text(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Binding::Id(id) => SqlValue::Text(id.to_string()),
        }
    }

    fn to_native(&self) -> rusqlite::types::Value {
        self.lower().into_native()
    }
}

impl From<i64> for Binding {
    fn from(v: i64) -> Self {
        Binding::Integer(v)
    }
}

impl From<i32> for Binding {
    fn from(v: i32) -> Self {
        Binding::Integer(i64::from(v))
    }
}

impl From<f64> for Binding {
    fn from(v: f64) -> Self {
        Binding::Real(v)
    }
}

impl From<bool> for Binding {
    fn from(v: bool) -> Self {
        Binding::Bool(v)
    }
}

impl From<&str> for Binding {
    fn from(v: &str) -> Self {
        Binding::Text(v.to_string())
    }
}

impl From<String> for Binding {
    fn from(v: String) -> Self {
        Binding::Text(v)
    }
}

impl From<Vec<u8>> for Binding {
    fn from(v: Vec<u8>) -> Self {
        Binding::Blob(v)
    }
}

impl From<DateTime<Utc>> for Binding {
    fn from(v: DateTime<Utc>) -> Self {
        Binding::Timestamp(v)
    }
}

impl From<Uuid> for Binding {
    fn from(v: Uuid) -> Self {
        Binding::Id(v)
    }
}

impl<T: Into<Binding>> From<Option<T>> for Binding {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Binding::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution against a live connection
// ---------------------------------------------------------------------------
//
// These two functions are the only place rusqlite statements run. The backends
// call them from inside their transaction wrappers; nothing above this layer
// sees a native connection.

pub(crate) fn run_fetch(conn: &Connection, statement: &CompiledStatement) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare_cached(&statement.sql)?;
    let header: Arc<[String]> = stmt
        .column_names()
        .into_iter()
        .map(str::to_owned)
        .collect::<Vec<_>>()
        .into();
    let width = header.len();

    let mut rows = stmt.query(params_from_iter(statement.bindings.iter().map(Binding::to_native)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(SqlValue::from_native(row.get::<_, rusqlite::types::Value>(i)?));
        }
        out.push(Row::new(Arc::clone(&header), values));
    }
    Ok(out)
}

pub(crate) fn run_execute(conn: &Connection, statement: &CompiledStatement) -> Result<usize> {
    let mut stmt = conn.prepare_cached(&statement.sql)?;
    let affected = stmt.execute(params_from_iter(statement.bindings.iter().map(Binding::to_native)))?;
    Ok(affected)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
