//! Async-native backend.
//!
//! One connection behind an async lock; transactions run inline on the
//! calling task. Suited to hosts without a dedicated storage thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use tokio::sync::Mutex;
use tracing::debug;

use super::{apply_pragmas, next_connection_id, run_in_tx};
use crate::config::StorageLocation;
use crate::error::{FreshetError, Result};
use crate::observer::{ChangeEvent, ChangeObserver, ChangeOp, ChangeSink, HookControl};

struct DirectInner {
    conn: Arc<Mutex<Connection>>,
    observer: ChangeObserver,
    path: Option<PathBuf>,
    writable: bool,
    id: u64,
}

/// Backend that runs storage work on the calling task, serialized by an
/// async lock. Clones share the connection.
#[derive(Clone)]
pub struct DirectBackend {
    inner: Arc<DirectInner>,
}

impl DirectBackend {
    /// Open (creating if missing) a read-write database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<DirectBackend> {
        let path = path.as_ref().to_owned();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        apply_pragmas(&conn)?;
        Ok(Self::start(conn, Some(path), true))
    }

    /// Open an existing database without write access.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<DirectBackend> {
        let path = path.as_ref().to_owned();
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&path, flags)?;
        Ok(Self::start(conn, Some(path), false))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<DirectBackend> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::start(conn, None, true))
    }

    /// Open whatever `location` resolves to.
    pub fn open_at(location: &StorageLocation) -> Result<DirectBackend> {
        match location {
            StorageLocation::File(path) => Self::open(path),
            StorageLocation::Memory => Self::open_in_memory(),
        }
    }

    fn start(conn: Connection, path: Option<PathBuf>, writable: bool) -> DirectBackend {
        let conn = Arc::new(Mutex::new(conn));
        let observer = ChangeObserver::new(Box::new(DirectHook {
            conn: Arc::clone(&conn),
        }));
        let id = next_connection_id();
        debug!(connection = id, ?path, writable, "direct backend started");
        DirectBackend {
            inner: Arc::new(DirectInner {
                conn,
                observer,
                path,
                writable,
                id,
            }),
        }
    }

    pub(crate) async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.inner.conn.lock().await;
        run_in_tx(&mut conn, TransactionBehavior::Deferred, f)
    }

    pub(crate) async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.inner.writable {
            return Err(FreshetError::ReadOnlyBackend);
        }
        let mut conn = self.inner.conn.lock().await;
        run_in_tx(&mut conn, TransactionBehavior::Immediate, f)
    }

    pub(crate) fn observer(&self) -> &ChangeObserver {
        &self.inner.observer
    }

    pub fn storage_path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn connection_id(&self) -> u64 {
        self.inner.id
    }

    pub fn writable(&self) -> bool {
        self.inner.writable
    }

    /// Remove the hook and drop every listener. The connection itself is
    /// released when the last clone goes away.
    pub async fn close(&self) -> Result<()> {
        self.inner.observer.teardown();
        let conn = self.inner.conn.lock().await;
        conn.update_hook(None::<fn(rusqlite::hooks::Action, &str, &str, i64)>);
        debug!(connection = self.inner.id, "direct backend closed");
        Ok(())
    }
}

struct DirectHook {
    conn: Arc<Mutex<Connection>>,
}

#[async_trait]
impl HookControl for DirectHook {
    async fn install(&self, sink: ChangeSink) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.update_hook(Some(
            move |action, _db: &str, table: &str, row_id: i64| {
                if let Some(op) = ChangeOp::from_action(action) {
                    sink.raise(ChangeEvent {
                        op,
                        table: table.to_owned(),
                        row_id,
                    });
                }
            },
        ));
        Ok(())
    }

    fn remove(&self) {
        // Best effort under contention; close removes it again while
        // holding the lock.
        if let Ok(conn) = self.conn.try_lock() {
            conn.update_hook(None::<fn(rusqlite::hooks::Action, &str, &str, i64)>);
        }
    }
}
