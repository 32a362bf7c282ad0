use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::error::DecodeError;
use crate::types::SqlValue;

/// Fallback accepted by [`Row::timestamp`] next to RFC 3339: the layout
/// SQLite's own `datetime()` emits.
const SQLITE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

// ---------------------------------------------------------------------------
// ColumnKind
// ---------------------------------------------------------------------------

/// The kind an accessor asked a column to decode as. Carried inside
/// [`DecodeError`] so failures name what was expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Blob,
    Bool,
    Timestamp,
    Id,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnKind::Integer => "integer",
            ColumnKind::Real => "real",
            ColumnKind::Text => "text",
            ColumnKind::Blob => "blob",
            ColumnKind::Bool => "boolean",
            ColumnKind::Timestamp => "timestamp",
            ColumnKind::Id => "identifier",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Row
// ---------------------------------------------------------------------------

/// One returned row: a shared column header plus an owned scalar per column.
///
/// Lookup is by column name, case-insensitively (SQLite treats identifiers
/// that way). The typed accessors fail with a named [`DecodeError`] rather
/// than panicking, and every accessor has an `_opt` twin that decodes SQL
/// `NULL` to `None` instead of erroring.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Column names, in statement order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw scalar for a column, `None` when no such column exists.
    pub fn value(&self, column: &str) -> Option<&SqlValue> {
        self.index_of(column).map(|i| &self.values[i])
    }

    /// Whether the named column holds SQL `NULL`. Absent columns are not null.
    pub fn is_null(&self, column: &str) -> bool {
        matches!(self.value(column), Some(SqlValue::Null))
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        if let Some(i) = self.columns.iter().position(|c| c == column) {
            return Some(i);
        }
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
    }

    fn require(&self, column: &str, expected: ColumnKind) -> Result<&SqlValue, DecodeError> {
        self.value(column).ok_or_else(|| DecodeError::MissingColumn {
            column: column.to_string(),
            expected,
        })
    }

    fn get<'a, T>(
        &'a self,
        column: &str,
        expected: ColumnKind,
        decode: Decoder<'a, T>,
    ) -> Result<T, DecodeError> {
        let value = self.require(column, expected)?;
        if value.is_null() {
            return Err(DecodeError::UnexpectedNull {
                column: column.to_string(),
                expected,
            });
        }
        decode(value, column)
    }

    fn get_opt<'a, T>(
        &'a self,
        column: &str,
        expected: ColumnKind,
        decode: Decoder<'a, T>,
    ) -> Result<Option<T>, DecodeError> {
        let value = self.require(column, expected)?;
        if value.is_null() {
            return Ok(None);
        }
        decode(value, column).map(Some)
    }

    // --- primitive kinds ---

    pub fn integer(&self, column: &str) -> Result<i64, DecodeError> {
        self.get(column, ColumnKind::Integer, decode_integer)
    }

    pub fn integer_opt(&self, column: &str) -> Result<Option<i64>, DecodeError> {
        self.get_opt(column, ColumnKind::Integer, decode_integer)
    }

    pub fn real(&self, column: &str) -> Result<f64, DecodeError> {
        self.get(column, ColumnKind::Real, decode_real)
    }

    pub fn real_opt(&self, column: &str) -> Result<Option<f64>, DecodeError> {
        self.get_opt(column, ColumnKind::Real, decode_real)
    }

    pub fn text(&self, column: &str) -> Result<&str, DecodeError> {
        self.get(column, ColumnKind::Text, decode_text)
    }

    pub fn text_opt(&self, column: &str) -> Result<Option<&str>, DecodeError> {
        self.get_opt(column, ColumnKind::Text, decode_text)
    }

    pub fn blob(&self, column: &str) -> Result<&[u8], DecodeError> {
        self.get(column, ColumnKind::Blob, decode_blob)
    }

    pub fn blob_opt(&self, column: &str) -> Result<Option<&[u8]>, DecodeError> {
        self.get_opt(column, ColumnKind::Blob, decode_blob)
    }

    // --- derived kinds ---

    /// Boolean stored as an integer; zero is `false`, anything else `true`.
    pub fn boolean(&self, column: &str) -> Result<bool, DecodeError> {
        self.get(column, ColumnKind::Bool, decode_boolean)
    }

    pub fn boolean_opt(&self, column: &str) -> Result<Option<bool>, DecodeError> {
        self.get_opt(column, ColumnKind::Bool, decode_boolean)
    }

    /// Timestamp stored as text: RFC 3339, or SQLite's `datetime()` layout
    /// read as UTC.
    pub fn timestamp(&self, column: &str) -> Result<DateTime<Utc>, DecodeError> {
        self.get(column, ColumnKind::Timestamp, decode_timestamp)
    }

    pub fn timestamp_opt(&self, column: &str) -> Result<Option<DateTime<Utc>>, DecodeError> {
        self.get_opt(column, ColumnKind::Timestamp, decode_timestamp)
    }

    /// Identifier stored as hyphenated UUID text (any case accepted).
    pub fn id(&self, column: &str) -> Result<Uuid, DecodeError> {
        self.get(column, ColumnKind::Id, decode_id)
    }

    pub fn id_opt(&self, column: &str) -> Result<Option<Uuid>, DecodeError> {
        self.get_opt(column, ColumnKind::Id, decode_id)
    }
}

// ---------------------------------------------------------------------------
// FromRow
// ---------------------------------------------------------------------------

/// Decode one flat row into a typed record.
///
/// Implementors read the columns they declare through the typed accessors, so
/// a mismatch surfaces the column name and expected kind instead of trapping:
///
/// ```ignore
/// impl FromRow for User {
///     fn from_row(row: &Row) -> Result<Self, DecodeError> {
///         Ok(User {
///             id: row.id("id")?,
///             name: row.text("name")?.to_string(),
///             active: row.boolean("active")?,
///         })
///     }
/// }
/// ```
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self, DecodeError> {
        Ok(row.clone())
    }
}

// ---------------------------------------------------------------------------
// Per-kind decoders
// ---------------------------------------------------------------------------

type Decoder<'a, T> = fn(&'a SqlValue, &str) -> Result<T, DecodeError>;

fn mismatch(column: &str, expected: ColumnKind, value: &SqlValue) -> DecodeError {
    DecodeError::TypeMismatch {
        column: column.to_string(),
        expected,
        found: value.kind_name(),
    }
}

fn decode_integer(value: &SqlValue, column: &str) -> Result<i64, DecodeError> {
    match value {
        SqlValue::Integer(i) => Ok(*i),
        other => Err(mismatch(column, ColumnKind::Integer, other)),
    }
}

fn decode_real(value: &SqlValue, column: &str) -> Result<f64, DecodeError> {
    match value {
        SqlValue::Real(r) => Ok(*r),
        // SQLite's numeric affinity happily hands back integers for REAL columns.
        SqlValue::Integer(i) => Ok(*i as f64),
        other => Err(mismatch(column, ColumnKind::Real, other)),
    }
}

fn decode_text<'a>(value: &'a SqlValue, column: &str) -> Result<&'a str, DecodeError> {
    match value {
        SqlValue::Text(t) => Ok(t.as_str()),
        other => Err(mismatch(column, ColumnKind::Text, other)),
    }
}

fn decode_blob<'a>(value: &'a SqlValue, column: &str) -> Result<&'a [u8], DecodeError> {
    match value {
        SqlValue::Blob(b) => Ok(b.as_slice()),
        other => Err(mismatch(column, ColumnKind::Blob, other)),
    }
}

fn decode_boolean(value: &SqlValue, column: &str) -> Result<bool, DecodeError> {
    match value {
        SqlValue::Integer(i) => Ok(*i != 0),
        other => Err(mismatch(column, ColumnKind::Bool, other)),
    }
}

fn decode_timestamp(value: &SqlValue, column: &str) -> Result<DateTime<Utc>, DecodeError> {
    let text = match value {
        SqlValue::Text(t) => t,
        other => return Err(mismatch(column, ColumnKind::Timestamp, other)),
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, SQLITE_DATETIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| mismatch(column, ColumnKind::Timestamp, value))
}

fn decode_id(value: &SqlValue, column: &str) -> Result<Uuid, DecodeError> {
    let text = match value {
        SqlValue::Text(t) => t,
        other => return Err(mismatch(column, ColumnKind::Id, other)),
    };
    Uuid::parse_str(text).map_err(|_| mismatch(column, ColumnKind::Id, value))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
