use std::sync::Arc;
use thiserror::Error;

use crate::row::ColumnKind;

// ---------------------------------------------------------------------------
// DecodeError
// ---------------------------------------------------------------------------

/// A row-to-record decoding failure. Carries the offending column name and the
/// kind the caller asked for, so the message pinpoints the field that broke.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Missing column \"{column}\" (expected {expected})")]
    MissingColumn { column: String, expected: ColumnKind },

    #[error("Type mismatch for column \"{column}\": expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        expected: ColumnKind,
        found: &'static str,
    },

    #[error("Unexpected NULL in column \"{column}\" (expected {expected})")]
    UnexpectedNull { column: String, expected: ColumnKind },
}

impl DecodeError {
    /// The column that failed to decode.
    pub fn column(&self) -> &str {
        match self {
            DecodeError::MissingColumn { column, .. }
            | DecodeError::TypeMismatch { column, .. }
            | DecodeError::UnexpectedNull { column, .. } => column,
        }
    }
}

// ---------------------------------------------------------------------------
// FreshetError, the top-level rollup
// ---------------------------------------------------------------------------

/// All failures surfaced by this crate.
///
/// The enum is `Clone` so one outcome can fan out to every waiter of a
/// deduplicated load and be replayed to listeners attaching later; backend and
/// I/O errors ride in an `Arc` to keep that cheap.
#[derive(Debug, Clone, Error)]
pub enum FreshetError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Query matched no rows")]
    NotFound,

    #[error("Write attempted on a read-only backend")]
    ReadOnlyBackend,

    #[error("Change hook installation failed: {0}")]
    ObserverInstall(String),

    #[error("Backend execution failed: {0}")]
    Execution(Arc<rusqlite::Error>),

    #[error("Storage I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Backend connection closed")]
    Closed,
}

impl From<rusqlite::Error> for FreshetError {
    fn from(e: rusqlite::Error) -> Self {
        FreshetError::Execution(Arc::new(e))
    }
}

impl From<std::io::Error> for FreshetError {
    fn from(e: std::io::Error) -> Self {
        FreshetError::Io(Arc::new(e))
    }
}

/// Convenience alias; the default error type is [`FreshetError`].
pub type Result<T, E = FreshetError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
