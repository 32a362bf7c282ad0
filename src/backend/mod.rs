//! Storage backends and the capability surface above them.
//!
//! Two execution models reach the same four capabilities: reads, writes,
//! path resolution, and table observation. [`QueueBackend`] serializes work
//! onto a dedicated thread owning the connection; [`DirectBackend`] shares a
//! single async-guarded connection. Everything above this module speaks
//! [`Backend`] and never touches a raw connection.

mod direct;
mod queue;

pub use direct::DirectBackend;
pub use queue::QueueBackend;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusqlite::{Connection, TransactionBehavior};

use crate::error::{FreshetError, Result};
use crate::observer::{ChangeCallback, ChangeObserver, WatchGuard};
use crate::row::{FromRow, Row};
use crate::statement::{run_execute, run_fetch, CompiledStatement};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity for an opened connection; part of the fetch key.
pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Pragmas for writable file-backed connections, applied before the worker
/// or lock takes over.
pub(crate) fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

/// Run `f` inside a transaction, committing on success. An error drops the
/// transaction, which rolls it back.
pub(crate) fn run_in_tx<T>(
    conn: &mut Connection,
    behavior: TransactionBehavior,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction_with_behavior(behavior)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// A handle to one open database, independent of execution model.
///
/// Cloning is cheap; clones share the underlying connection and observer.
#[derive(Clone)]
pub enum Backend {
    Queue(QueueBackend),
    Direct(DirectBackend),
}

impl Backend {
    /// Run read-only work inside a deferred transaction.
    pub(crate) async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match self {
            Backend::Queue(b) => b.read(f).await,
            Backend::Direct(b) => b.read(f).await,
        }
    }

    /// Run mutating work inside an immediate transaction.
    ///
    /// Rejected with [`FreshetError::ReadOnlyBackend`] before any work runs
    /// if the backend was opened read-only.
    pub(crate) async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match self {
            Backend::Queue(b) => b.write(f).await,
            Backend::Direct(b) => b.write(f).await,
        }
    }

    /// Execute a statement for its side effects; returns the affected row
    /// count.
    pub async fn execute(&self, statement: &CompiledStatement) -> Result<usize> {
        let statement = statement.clone();
        self.write(move |conn| run_execute(conn, &statement)).await
    }

    /// Fetch every row produced by `statement`, undecoded.
    pub async fn fetch_rows(&self, statement: &CompiledStatement) -> Result<Vec<Row>> {
        let statement = statement.clone();
        self.read(move |conn| run_fetch(conn, &statement)).await
    }

    /// Fetch and decode every row.
    pub async fn fetch_all<T: FromRow>(&self, statement: &CompiledStatement) -> Result<Vec<T>> {
        let rows = self.fetch_rows(statement).await?;
        rows.iter()
            .map(|row| T::from_row(row).map_err(FreshetError::from))
            .collect()
    }

    /// Fetch and decode the first row; [`FreshetError::NotFound`] when the
    /// statement matches nothing.
    pub async fn fetch_one<T: FromRow>(&self, statement: &CompiledStatement) -> Result<T> {
        let rows = self.fetch_rows(statement).await?;
        let first = rows.first().ok_or(FreshetError::NotFound)?;
        Ok(T::from_row(first)?)
    }

    /// Filesystem path of the database, `None` for in-memory storage.
    pub fn storage_path(&self) -> Option<&Path> {
        match self {
            Backend::Queue(b) => b.storage_path(),
            Backend::Direct(b) => b.storage_path(),
        }
    }

    /// Invoke `callback` after any committed mutation of the given tables.
    /// The callback carries no payload; it only signals that a re-read is due.
    ///
    /// The first watch on a backend installs the native hook before this
    /// returns, so no later commit can slip past unobserved. The guard
    /// unregisters on drop.
    pub async fn observe_tables(
        &self,
        tables: BTreeSet<String>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<WatchGuard> {
        let callback: ChangeCallback = Arc::new(callback);
        self.observer().add_listener(tables, callback).await
    }

    fn observer(&self) -> &ChangeObserver {
        match self {
            Backend::Queue(b) => b.observer(),
            Backend::Direct(b) => b.observer(),
        }
    }

    /// Stable identity of the underlying connection within this process.
    pub fn connection_id(&self) -> u64 {
        match self {
            Backend::Queue(b) => b.connection_id(),
            Backend::Direct(b) => b.connection_id(),
        }
    }

    pub fn writable(&self) -> bool {
        match self {
            Backend::Queue(b) => b.writable(),
            Backend::Direct(b) => b.writable(),
        }
    }

    /// Number of live table watches.
    pub fn active_watches(&self) -> usize {
        self.observer().listener_count()
    }

    /// Drop all watches, remove the native hook, and release backend
    /// resources.
    pub async fn close(&self) -> Result<()> {
        match self {
            Backend::Queue(b) => b.close().await,
            Backend::Direct(b) => b.close().await,
        }
    }
}

impl From<QueueBackend> for Backend {
    fn from(backend: QueueBackend) -> Backend {
        Backend::Queue(backend)
    }
}

impl From<DirectBackend> for Backend {
    fn from(backend: DirectBackend) -> Backend {
        Backend::Direct(backend)
    }
}
