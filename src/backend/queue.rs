//! Queue-serialized backend.
//!
//! A dedicated worker thread owns the connection; callers enqueue closures
//! and await the reply. Hook installation and removal travel the same queue,
//! so they are ordered with respect to reads and writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{apply_pragmas, next_connection_id, run_in_tx};
use crate::config::StorageLocation;
use crate::error::{FreshetError, Result};
use crate::observer::{ChangeEvent, ChangeObserver, ChangeOp, ChangeSink, HookControl};

enum Job {
    Run(Box<dyn FnOnce(&mut Connection) + Send>),
    InstallHook {
        sink: ChangeSink,
        ack: oneshot::Sender<()>,
    },
    RemoveHook,
    Shutdown,
}

fn run_worker(mut conn: Connection, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.blocking_recv() {
        match job {
            Job::Run(work) => work(&mut conn),
            Job::InstallHook { sink, ack } => {
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
                let _ = ack.send(());
            }
            Job::RemoveHook => {
                conn.update_hook(None::<fn(rusqlite::hooks::Action, &str, &str, i64)>);
            }
            Job::Shutdown => break,
        }
    }
    debug!("queue worker exited");
}

struct QueueInner {
    jobs: mpsc::UnboundedSender<Job>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    observer: ChangeObserver,
    path: Option<PathBuf>,
    writable: bool,
    id: u64,
}

/// Backend whose connection lives on a dedicated worker thread.
///
/// Clones share the worker. The worker exits when `close` runs or every
/// clone is gone.
#[derive(Clone)]
pub struct QueueBackend {
    inner: Arc<QueueInner>,
}

impl QueueBackend {
    /// Open (creating if missing) a read-write database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<QueueBackend> {
        let path = path.as_ref().to_owned();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        apply_pragmas(&conn)?;
        Self::start(conn, Some(path), true)
    }

    /// Open an existing database without write access.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<QueueBackend> {
        let path = path.as_ref().to_owned();
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&path, flags)?;
        Self::start(conn, Some(path), false)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<QueueBackend> {
        let conn = Connection::open_in_memory()?;
        Self::start(conn, None, true)
    }

    /// Open whatever `location` resolves to.
    pub fn open_at(location: &StorageLocation) -> Result<QueueBackend> {
        match location {
            StorageLocation::File(path) => Self::open(path),
            StorageLocation::Memory => Self::open_in_memory(),
        }
    }

    fn start(conn: Connection, path: Option<PathBuf>, writable: bool) -> Result<QueueBackend> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = next_connection_id();
        let worker = thread::Builder::new()
            .name(format!("freshet-queue-{id}"))
            .spawn(move || run_worker(conn, rx))?;
        let observer = ChangeObserver::new(Box::new(QueueHook { jobs: tx.clone() }));
        debug!(connection = id, ?path, writable, "queue backend started");
        Ok(QueueBackend {
            inner: Arc::new(QueueInner {
                jobs: tx,
                worker: Mutex::new(Some(worker)),
                observer,
                path,
                writable,
                id,
            }),
        })
    }

    pub(crate) async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(TransactionBehavior::Deferred, f).await
    }

    pub(crate) async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.inner.writable {
            return Err(FreshetError::ReadOnlyBackend);
        }
        self.run(TransactionBehavior::Immediate, f).await
    }

    async fn run<T, F>(&self, behavior: TransactionBehavior, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job::Run(Box::new(move |conn: &mut Connection| {
            let outcome = run_in_tx(conn, behavior, f);
            let _ = reply_tx.send(outcome);
        }));
        self.inner.jobs.send(job).map_err(|_| FreshetError::Closed)?;
        reply_rx.await.map_err(|_| FreshetError::Closed)?
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

    /// Remove the hook, stop the worker, and wait for it to finish.
    pub async fn close(&self) -> Result<()> {
        self.inner.observer.teardown();
        let _ = self.inner.jobs.send(Job::Shutdown);
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || {
                if handle.join().is_err() {
                    warn!("queue worker panicked during shutdown");
                }
            })
            .await
            .map_err(|_| FreshetError::Closed)?;
        }
        debug!(connection = self.inner.id, "queue backend closed");
        Ok(())
    }
}

struct QueueHook {
    jobs: mpsc::UnboundedSender<Job>,
}

#[async_trait]
impl HookControl for QueueHook {
    async fn install(&self, sink: ChangeSink) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.jobs
            .send(Job::InstallHook { sink, ack: ack_tx })
            .map_err(|_| FreshetError::Closed)?;
        ack_rx.await.map_err(|_| FreshetError::Closed)
    }

    fn remove(&self) {
        let _ = self.jobs.send(Job::RemoveHook);
    }
}
