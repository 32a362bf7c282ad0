//! Mutation observation and per-table listener fan-out.
//!
//! One native update hook per connection feeds a registry of listeners, each
//! scoped to a set of tables. The hook is installed on first registration,
//! before the caller regains control, and stays physically installed until
//! the backend closes; an empty registry merely disarms dispatch. Callbacks
//! run outside the registry lock and a panicking listener never silences the
//! others.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{FreshetError, Result};

/// Kind of row mutation reported by the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub(crate) fn from_action(action: rusqlite::hooks::Action) -> Option<ChangeOp> {
        use rusqlite::hooks::Action;
        match action {
            Action::SQLITE_INSERT => Some(ChangeOp::Insert),
            Action::SQLITE_UPDATE => Some(ChangeOp::Update),
            Action::SQLITE_DELETE => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

/// One committed row mutation, raised by the native hook and consumed by
/// dispatch immediately; never stored.
#[derive(Debug, Clone)]
pub(crate) struct ChangeEvent {
    pub(crate) op: ChangeOp,
    pub(crate) table: String,
    pub(crate) row_id: i64,
}

pub type ListenerId = u64;

/// Listener notification. Carries no payload; it only signals that one of
/// the watched tables changed and the listener should re-read.
pub(crate) type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Backend-specific installation of the native update hook.
///
/// `install` must not return before the hook is live on the connection;
/// `remove` is best-effort and only runs at close.
#[async_trait]
pub(crate) trait HookControl: Send + Sync {
    async fn install(&self, sink: ChangeSink) -> Result<()>;
    fn remove(&self);
}

/// Entry point the native hook raises events into.
///
/// Holds the observer weakly: the hook closure lives inside the connection,
/// which the backend owns, which owns the observer. A strong reference here
/// would cycle and leak all three.
#[derive(Clone)]
pub(crate) struct ChangeSink {
    shared: Weak<ObserverShared>,
}

impl ChangeSink {
    pub(crate) fn raise(&self, event: ChangeEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatch(&event);
        }
    }
}

struct ListenerEntry {
    /// Lowercased table names this listener cares about.
    tables: BTreeSet<String>,
    callback: ChangeCallback,
}

struct ObserverState {
    listeners: HashMap<ListenerId, ListenerEntry>,
    next_id: ListenerId,
    hook_installed: bool,
    /// False whenever the registry is empty; dispatch checks this before
    /// touching the listener table.
    armed: bool,
}

pub(crate) struct ObserverShared {
    state: Mutex<ObserverState>,
    /// Serializes hook installation without holding the state lock across
    /// the backend round trip.
    install_serial: tokio::sync::Mutex<()>,
    control: Box<dyn HookControl>,
}

impl ObserverShared {
    fn dispatch(&self, event: &ChangeEvent) {
        let table = event.table.to_ascii_lowercase();
        let targets: Vec<ChangeCallback> = {
            let state = self.state.lock();
            if !state.armed {
                return;
            }
            state
                .listeners
                .values()
                .filter(|entry| entry.tables.contains(&table))
                .map(|entry| Arc::clone(&entry.callback))
                .collect()
        };
        if targets.is_empty() {
            return;
        }
        debug!(
            table = %event.table,
            op = ?event.op,
            rowid = event.row_id,
            listeners = targets.len(),
            "change event"
        );
        for callback in targets {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                warn!(table = %event.table, "change listener panicked");
            }
        }
    }

    fn remove_listener(&self, id: ListenerId) {
        let mut state = self.state.lock();
        if state.listeners.remove(&id).is_some() && state.listeners.is_empty() {
            // The hook stays physically installed until close; an empty
            // registry only disarms dispatch. Re-registration then never
            // races a concurrent uninstall.
            state.armed = false;
            debug!("last watch removed, dispatch disarmed");
        }
    }
}

pub(crate) struct ChangeObserver {
    shared: Arc<ObserverShared>,
}

impl ChangeObserver {
    pub(crate) fn new(control: Box<dyn HookControl>) -> ChangeObserver {
        ChangeObserver {
            shared: Arc::new(ObserverShared {
                state: Mutex::new(ObserverState {
                    listeners: HashMap::new(),
                    next_id: 0,
                    hook_installed: false,
                    armed: false,
                }),
                install_serial: tokio::sync::Mutex::new(()),
                control,
            }),
        }
    }

    /// Register a callback for mutations touching any of `tables`.
    ///
    /// The first registration installs the native hook before returning, so
    /// a mutation committed after this call resolves cannot go unreported.
    pub(crate) async fn add_listener(
        &self,
        tables: BTreeSet<String>,
        callback: ChangeCallback,
    ) -> Result<WatchGuard> {
        self.ensure_hook().await?;
        let tables: BTreeSet<String> = tables
            .into_iter()
            .map(|mut t| {
                t.make_ascii_lowercase();
                t
            })
            .collect();
        let id = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.listeners.insert(id, ListenerEntry { tables, callback });
            state.armed = true;
            id
        };
        debug!(listener = id, "watch registered");
        Ok(WatchGuard {
            shared: Arc::clone(&self.shared),
            id,
            released: AtomicBool::new(false),
        })
    }

    async fn ensure_hook(&self) -> Result<()> {
        if self.shared.state.lock().hook_installed {
            return Ok(());
        }
        let _serial = self.shared.install_serial.lock().await;
        if self.shared.state.lock().hook_installed {
            return Ok(());
        }
        let sink = ChangeSink {
            shared: Arc::downgrade(&self.shared),
        };
        self.shared
            .control
            .install(sink)
            .await
            .map_err(|e| FreshetError::ObserverInstall(e.to_string()))?;
        self.shared.state.lock().hook_installed = true;
        debug!("native change hook installed");
        Ok(())
    }

    /// Drop every listener and physically remove the hook. Called at close.
    pub(crate) fn teardown(&self) {
        let installed = {
            let mut state = self.shared.state.lock();
            state.listeners.clear();
            state.armed = false;
            std::mem::take(&mut state.hook_installed)
        };
        if installed {
            self.shared.control.remove();
            debug!("native change hook removed");
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.shared.state.lock().listeners.len()
    }
}

/// Handle to a registered table watch; dropping it unregisters the listener.
pub struct WatchGuard {
    shared: Arc<ObserverShared>,
    id: ListenerId,
    released: AtomicBool,
}

impl WatchGuard {
    /// Unregister now. Idempotent.
    pub fn cancel(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.shared.remove_listener(self.id);
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchGuard")
            .field("id", &self.id)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}
