//! Keyed query subscriptions and deduplicated one-shot loads.
//!
//! Each distinct (connection, statement, bindings) triple owns at most one
//! live subscription. Later subscribers attach as extra listeners and replay
//! the last delivered result instead of fetching again; a change signal from
//! the watched tables re-runs the fetch once and fans the shared outcome out
//! to every listener. Failures travel the same path as results.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::backend::Backend;
use crate::error::{FreshetError, Result};
use crate::observer::WatchGuard;
use crate::row::{FromRow, Row};
use crate::statement::CompiledStatement;
use crate::types::SqlValue;
use crate::watch_set::referenced_tables;

/// Identity of a fetch: which connection, which statement, which bindings.
/// Two queries with equal keys share one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchKey {
    connection: u64,
    statement: u64,
}

impl FetchKey {
    pub(crate) fn of(backend: &Backend, statement: &CompiledStatement) -> FetchKey {
        FetchKey {
            connection: backend.connection_id(),
            statement: statement_digest(statement),
        }
    }
}

/// Hash of the statement text plus its lowered bindings. 0xFF separates the
/// two; it cannot occur in UTF-8 text. Each value is tagged so `1` and `'1'`
/// never collide.
fn statement_digest(statement: &CompiledStatement) -> u64 {
    let mut buf = Vec::with_capacity(statement.sql.len() + 16);
    buf.extend_from_slice(statement.sql.as_bytes());
    buf.push(0xFF);
    for binding in &statement.bindings {
        match binding.lower() {
            SqlValue::Null => buf.push(0),
            SqlValue::Integer(n) => {
                buf.push(1);
                buf.extend_from_slice(&n.to_le_bytes());
            }
            SqlValue::Real(f) => {
                buf.push(2);
                buf.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            SqlValue::Text(s) => {
                buf.push(3);
                buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            SqlValue::Blob(b) => {
                buf.push(4);
                buf.extend_from_slice(&(b.len() as u64).to_le_bytes());
                buf.extend_from_slice(&b);
            }
        }
    }
    xxh3_64(&buf)
}

/// Outcome of one fetch cycle, shared across every listener on the key.
pub type SharedRows = Result<Arc<Vec<Row>>, FreshetError>;

type DeliverRaw = Arc<dyn Fn(&SharedRows) + Send + Sync>;

struct Listener {
    id: u64,
    deliver: DeliverRaw,
    /// Generation of the last outcome delivered to this listener.
    seen: u64,
}

struct Subscription {
    listeners: Vec<Listener>,
    /// Most recently delivered outcome, replayed to late attachers.
    last: Option<SharedRows>,
    /// Bumped on every store of `last`; together with `Listener::seen` it
    /// keeps replay and fan-out exactly-once per listener.
    generation: u64,
    watch: Option<WatchGuard>,
    /// Held across every delivery, driver fan-out and attach replay alike;
    /// keeps each listener's view in store order.
    delivery: Arc<Mutex<()>>,
}

#[derive(Default)]
struct DispatcherState {
    subscriptions: HashMap<FetchKey, Subscription>,
    loads: HashMap<FetchKey, Vec<oneshot::Sender<SharedRows>>>,
    next_listener: u64,
}

/// Registry of live subscriptions and in-flight loads.
///
/// Cheap to clone; clones share the registry. One dispatcher can serve any
/// number of backends, since connection identity is part of the key.
#[derive(Clone, Default)]
pub struct Dispatcher {
    state: Arc<Mutex<DispatcherState>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// Number of live keyed subscriptions (not listeners).
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    // ---- one-shot loads ----

    /// Fetch once, decoded. Concurrent loads of one key share a single
    /// backend fetch.
    pub async fn load<T: FromRow>(
        &self,
        backend: &Backend,
        statement: CompiledStatement,
    ) -> Result<Vec<T>> {
        let rows = self.load_rows(backend, statement).await?;
        rows.iter()
            .map(|row| T::from_row(row).map_err(FreshetError::from))
            .collect()
    }

    /// Fetch once and decode the first row; [`FreshetError::NotFound`] when
    /// nothing matches.
    pub async fn load_one<T: FromRow>(
        &self,
        backend: &Backend,
        statement: CompiledStatement,
    ) -> Result<T> {
        let rows = self.load_rows(backend, statement).await?;
        let first = rows.first().ok_or(FreshetError::NotFound)?;
        Ok(T::from_row(first)?)
    }

    /// Fetch once, undecoded. Every deduplicated caller receives the same
    /// shared allocation.
    pub async fn load_rows(
        &self,
        backend: &Backend,
        statement: CompiledStatement,
    ) -> Result<Arc<Vec<Row>>> {
        let key = FetchKey::of(backend, &statement);
        let pending = {
            let mut state = self.state.lock();
            match state.loads.get_mut(&key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    state.loads.insert(key, Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = pending {
            return rx.await.map_err(|_| FreshetError::Closed)?;
        }

        debug!(?key, "load fetch");
        let state = Arc::clone(&self.state);
        let backend = backend.clone();
        let (tx, rx) = oneshot::channel();
        // Detached, so a caller dropping its future cannot strand the other
        // waiters registered on this key.
        tokio::spawn(async move {
            let outcome: SharedRows = backend.fetch_rows(&statement).await.map(Arc::new);
            let waiters = {
                let mut state = state.lock();
                state.loads.remove(&key).unwrap_or_default()
            };
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
            let _ = tx.send(outcome);
        });
        rx.await.map_err(|_| FreshetError::Closed)?
    }

    // ---- continuous subscriptions ----

    /// Deliver the decoded result set now and after every committed mutation
    /// of a table the statement references.
    ///
    /// Fetch and decode failures arrive as `Err` values through `deliver`;
    /// the subscription stays registered and recovers on the next change.
    /// The returned handle detaches on drop.
    pub async fn subscribe<T, F>(
        &self,
        backend: &Backend,
        statement: CompiledStatement,
        deliver: F,
    ) -> Result<WatchHandle>
    where
        T: FromRow + 'static,
        F: Fn(Result<Vec<T>>) + Send + Sync + 'static,
    {
        self.subscribe_raw(backend, statement, move |outcome| {
            deliver(decode_all(outcome));
        })
        .await
    }

    /// Like [`subscribe`](Dispatcher::subscribe) but delivers only the first
    /// row, with [`FreshetError::NotFound`] as the failure value when the
    /// result set is empty.
    pub async fn subscribe_one<T, F>(
        &self,
        backend: &Backend,
        statement: CompiledStatement,
        deliver: F,
    ) -> Result<WatchHandle>
    where
        T: FromRow + 'static,
        F: Fn(Result<T>) + Send + Sync + 'static,
    {
        self.subscribe_raw(backend, statement, move |outcome| {
            deliver(decode_first(outcome));
        })
        .await
    }

    /// Subscribe at the raw row level; per-listener decoding happens above.
    pub async fn subscribe_raw(
        &self,
        backend: &Backend,
        statement: CompiledStatement,
        deliver: impl Fn(&SharedRows) + Send + Sync + 'static,
    ) -> Result<WatchHandle> {
        let key = FetchKey::of(backend, &statement);
        let deliver: DeliverRaw = Arc::new(deliver);

        enum Attach {
            Existing {
                delivery: Arc<Mutex<()>>,
            },
            Created {
                signals: mpsc::UnboundedReceiver<()>,
                signal: mpsc::UnboundedSender<()>,
                delivery: Arc<Mutex<()>>,
            },
        }

        let (listener, attach) = {
            let mut state = self.state.lock();
            let listener = state.next_listener;
            state.next_listener += 1;
            let added = Listener {
                id: listener,
                deliver: Arc::clone(&deliver),
                seen: 0,
            };
            match state.subscriptions.entry(key) {
                Entry::Occupied(mut entry) => {
                    let sub = entry.get_mut();
                    sub.listeners.push(added);
                    (
                        listener,
                        Attach::Existing {
                            delivery: Arc::clone(&sub.delivery),
                        },
                    )
                }
                Entry::Vacant(entry) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let delivery = Arc::new(Mutex::new(()));
                    entry.insert(Subscription {
                        listeners: vec![added],
                        last: None,
                        generation: 0,
                        watch: None,
                        delivery: Arc::clone(&delivery),
                    });
                    (
                        listener,
                        Attach::Created {
                            signals: rx,
                            signal: tx,
                            delivery,
                        },
                    )
                }
            }
        };

        match attach {
            Attach::Existing { delivery } => {
                replay_latest(&self.state, &delivery, key, listener);
                debug!(?key, listener, "attached to existing subscription");
                Ok(WatchHandle::new(Arc::clone(&self.state), key, listener))
            }
            Attach::Created {
                signals,
                signal,
                delivery,
            } => {
                let tables = referenced_tables(&statement.sql);
                debug!(?key, ?tables, "subscription created");
                let watch = backend
                    .observe_tables(tables, move || {
                        let _ = signal.send(());
                    })
                    .await;
                match watch {
                    Ok(guard) => {
                        {
                            let mut state = self.state.lock();
                            if let Some(sub) = state.subscriptions.get_mut(&key) {
                                sub.watch = Some(guard);
                            }
                            // Entry already cancelled: the fresh guard drops
                            // here and unregisters the watch again.
                        }
                        tokio::spawn(drive(
                            Arc::clone(&self.state),
                            key,
                            backend.clone(),
                            statement,
                            signals,
                            delivery,
                        ));
                        Ok(WatchHandle::new(Arc::clone(&self.state), key, listener))
                    }
                    Err(e) => {
                        // Listeners that raced onto this key only have their
                        // callbacks; hand them the failure as a value. The
                        // creator hears it through the return instead.
                        let orphans: Vec<DeliverRaw> = {
                            let mut state = self.state.lock();
                            state
                                .subscriptions
                                .remove(&key)
                                .map(|sub| {
                                    sub.listeners
                                        .into_iter()
                                        .filter(|l| l.id != listener)
                                        .map(|l| l.deliver)
                                        .collect()
                                })
                                .unwrap_or_default()
                        };
                        let outcome: SharedRows = Err(e.clone());
                        for cb in orphans {
                            deliver_caught(key, &cb, &outcome);
                        }
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Fetch-and-fan-out loop for one subscription. Runs until the key is
/// removed from the registry or the last signal sender drops.
async fn drive(
    state: Arc<Mutex<DispatcherState>>,
    key: FetchKey,
    backend: Backend,
    statement: CompiledStatement,
    mut signals: mpsc::UnboundedReceiver<()>,
    delivery: Arc<Mutex<()>>,
) {
    let mut initial = true;
    loop {
        if !initial && signals.recv().await.is_none() {
            break;
        }
        initial = false;

        let outcome: SharedRows = backend.fetch_rows(&statement).await.map(Arc::new);
        if let Err(e) = &outcome {
            warn!(?key, error = %e, "subscription fetch failed");
        }

        // The delivery lock spans store and fan-out; an attach replay can
        // neither interleave with this batch nor run ahead of it.
        let serialize = delivery.lock();
        let targets: Vec<DeliverRaw> = {
            let mut state = state.lock();
            let Some(sub) = state.subscriptions.get_mut(&key) else {
                break;
            };
            if !Arc::ptr_eq(&sub.delivery, &delivery) {
                // The key was torn down and re-created mid-fetch; this
                // outcome belongs to the dead instance.
                break;
            }
            sub.generation += 1;
            sub.last = Some(outcome.clone());
            let generation = sub.generation;
            sub.listeners
                .iter_mut()
                .filter(|l| l.seen < generation)
                .map(|l| {
                    l.seen = generation;
                    Arc::clone(&l.deliver)
                })
                .collect()
        };
        for target in &targets {
            deliver_caught(key, target, &outcome);
        }
        drop(serialize);
    }
    debug!(?key, "subscription driver exited");
}

/// Bring one late attacher up to date. Re-reads `last` under the delivery
/// lock, skipping the listener when a driver fan-out already reached it.
fn replay_latest(
    state: &Mutex<DispatcherState>,
    delivery: &Mutex<()>,
    key: FetchKey,
    listener: u64,
) {
    let _serialize = delivery.lock();
    let pending = {
        let mut state = state.lock();
        state.subscriptions.get_mut(&key).and_then(|sub| {
            let outcome = sub.last.clone()?;
            let generation = sub.generation;
            let entry = sub.listeners.iter_mut().find(|l| l.id == listener)?;
            if entry.seen >= generation {
                return None;
            }
            entry.seen = generation;
            Some((Arc::clone(&entry.deliver), outcome))
        })
    };
    if let Some((deliver, outcome)) = pending {
        deliver_caught(key, &deliver, &outcome);
    }
}

/// Invoke one listener; a panic inside it is caught and logged.
fn deliver_caught(key: FetchKey, deliver: &DeliverRaw, outcome: &SharedRows) {
    if catch_unwind(AssertUnwindSafe(|| deliver(outcome))).is_err() {
        warn!(?key, "subscription listener panicked");
    }
}

fn decode_all<T: FromRow>(outcome: &SharedRows) -> Result<Vec<T>> {
    let rows = outcome.as_ref().map_err(FreshetError::clone)?;
    rows.iter()
        .map(|row| T::from_row(row).map_err(FreshetError::from))
        .collect()
}

fn decode_first<T: FromRow>(outcome: &SharedRows) -> Result<T> {
    let rows = outcome.as_ref().map_err(FreshetError::clone)?;
    let first = rows.first().ok_or(FreshetError::NotFound)?;
    Ok(T::from_row(first)?)
}

/// Handle to one attached listener. Cancelling (or dropping) detaches it;
/// detaching the last listener on a key tears the whole subscription down,
/// watch included.
pub struct WatchHandle {
    state: Arc<Mutex<DispatcherState>>,
    key: FetchKey,
    listener: u64,
    cancelled: AtomicBool,
}

impl WatchHandle {
    fn new(state: Arc<Mutex<DispatcherState>>, key: FetchKey, listener: u64) -> WatchHandle {
        WatchHandle {
            state,
            key,
            listener,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> FetchKey {
        self.key
    }

    /// Detach this listener. Idempotent, and safe to call from inside a
    /// delivery callback.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = {
            let mut state = self.state.lock();
            let destroy = match state.subscriptions.get_mut(&self.key) {
                Some(sub) => {
                    sub.listeners.retain(|l| l.id != self.listener);
                    sub.listeners.is_empty()
                }
                None => false,
            };
            if destroy {
                debug!(key = ?self.key, "last listener gone, subscription destroyed");
                state.subscriptions.remove(&self.key)
            } else {
                None
            }
        };
        // Dropped outside the lock: the watch guard unregisters against the
        // observer, and closing the signal sender stops the driver.
        drop(removed);
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
