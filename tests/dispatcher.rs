//! Dispatcher tests: deduplicated loads, shared subscriptions, replay,
//! change-driven redelivery, error-as-value flow, and teardown.

use std::sync::Arc;
use std::time::Duration;

use freshet::{
    Backend, CompiledStatement, DecodeError, DirectBackend, Dispatcher, FreshetError, FromRow,
    QueueBackend, Row, SharedRows, WatchHandle,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

// ============================================================================
// Test helpers
// ============================================================================

const SELECT_ITEMS: &str = "SELECT id, label FROM items ORDER BY id";

fn both() -> Vec<Backend> {
    vec![
        QueueBackend::open_in_memory().expect("open queue backend").into(),
        DirectBackend::open_in_memory().expect("open direct backend").into(),
    ]
}

async fn seed(backend: &Backend) {
    for ddl in [
        "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)",
        "CREATE TABLE other (id INTEGER PRIMARY KEY)",
    ] {
        backend.execute(&CompiledStatement::new(ddl)).await.expect("create table");
    }
    for (id, label) in [(1i64, "one"), (2, "two"), (3, "three")] {
        backend
            .execute(
                &CompiledStatement::new("INSERT INTO items (id, label) VALUES (?, ?)")
                    .bind(id)
                    .bind(label),
            )
            .await
            .expect("seed row");
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Item {
    id: i64,
    label: String,
}

impl FromRow for Item {
    fn from_row(row: &Row) -> Result<Item, DecodeError> {
        Ok(Item {
            id: row.integer("id")?,
            label: row.text("label")?.to_owned(),
        })
    }
}

fn ids(items: &[Item]) -> Vec<i64> {
    items.iter().map(|item| item.id).collect()
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery within deadline")
        .expect("delivery channel open")
}

/// Subscribe with a typed listener that forwards every batch to a channel.
async fn subscribe_items(
    dispatcher: &Dispatcher,
    backend: &Backend,
    sql: &str,
) -> (WatchHandle, mpsc::UnboundedReceiver<freshet::Result<Vec<Item>>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = dispatcher
        .subscribe::<Item, _>(backend, CompiledStatement::new(sql), move |batch| {
            let _ = tx.send(batch);
        })
        .await
        .expect("subscribe");
    (handle, rx)
}

// ============================================================================
// one-shot loads
// ============================================================================

#[tokio::test]
async fn load_returns_the_current_rows() {
    for backend in both() {
        seed(&backend).await;
        let dispatcher = Dispatcher::new();

        let items: Vec<Item> = dispatcher
            .load(&backend, CompiledStatement::new(SELECT_ITEMS))
            .await
            .unwrap();
        assert_eq!(ids(&items), vec![1, 2, 3]);

        // No mutation in between, so a second load sees the same values.
        let again: Vec<Item> = dispatcher
            .load(&backend, CompiledStatement::new(SELECT_ITEMS))
            .await
            .unwrap();
        assert_eq!(again, items);
    }
}

#[tokio::test]
async fn load_one_on_no_match_is_not_found() {
    for backend in both() {
        seed(&backend).await;
        let dispatcher = Dispatcher::new();

        let missing = dispatcher
            .load_one::<Item>(
                &backend,
                CompiledStatement::new("SELECT id, label FROM items WHERE id = ?").bind(42i64),
            )
            .await;
        assert!(matches!(missing, Err(FreshetError::NotFound)), "got {missing:?}");
    }
}

#[tokio::test]
async fn concurrent_identical_loads_share_one_fetch() {
    let backend: Backend = QueueBackend::open_in_memory().unwrap().into();
    seed(&backend).await;
    let dispatcher = Dispatcher::new();

    let (a, b) = tokio::join!(
        dispatcher.load_rows(&backend, CompiledStatement::new(SELECT_ITEMS)),
        dispatcher.load_rows(&backend, CompiledStatement::new(SELECT_ITEMS)),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert!(Arc::ptr_eq(&a, &b), "deduplicated loads share one allocation");
    assert_eq!(a.len(), 3);

    // Once the in-flight load resolves, the next one fetches fresh.
    let c = dispatcher
        .load_rows(&backend, CompiledStatement::new(SELECT_ITEMS))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
}

// ============================================================================
// subscription lifecycle
// ============================================================================

#[tokio::test]
async fn subscribe_delivers_the_initial_result() {
    for backend in both() {
        seed(&backend).await;
        let dispatcher = Dispatcher::new();

        let (_handle, mut rx) = subscribe_items(&dispatcher, &backend, SELECT_ITEMS).await;
        let initial = next(&mut rx).await.unwrap();

        assert_eq!(ids(&initial), vec![1, 2, 3]);
        assert_eq!(dispatcher.subscription_count(), 1);
        assert_eq!(backend.active_watches(), 1);
    }
}

#[tokio::test]
async fn each_watched_mutation_redelivers_exactly_once() {
    for backend in both() {
        seed(&backend).await;
        let dispatcher = Dispatcher::new();
        let (_handle, mut rx) = subscribe_items(&dispatcher, &backend, SELECT_ITEMS).await;
        next(&mut rx).await.unwrap();

        backend
            .execute(&CompiledStatement::new("DELETE FROM items WHERE id = 2"))
            .await
            .unwrap();
        let after_delete = next(&mut rx).await.unwrap();
        assert_eq!(ids(&after_delete), vec![1, 3]);

        backend
            .execute(&CompiledStatement::new("INSERT INTO items (id, label) VALUES (4, 'four')"))
            .await
            .unwrap();
        let after_insert = next(&mut rx).await.unwrap();
        assert_eq!(ids(&after_insert), vec![1, 3, 4]);

        assert!(rx.try_recv().is_err(), "one delivery per mutation");
    }
}

#[tokio::test]
async fn unrelated_tables_do_not_redeliver() {
    for backend in both() {
        seed(&backend).await;
        let dispatcher = Dispatcher::new();
        let (_handle, mut rx) = subscribe_items(&dispatcher, &backend, SELECT_ITEMS).await;
        next(&mut rx).await.unwrap();

        backend
            .execute(&CompiledStatement::new("INSERT INTO other (id) VALUES (1)"))
            .await
            .unwrap();
        backend
            .execute(&CompiledStatement::new("UPDATE items SET label = 'uno' WHERE id = 1"))
            .await
            .unwrap();

        // The only delivery after both mutations reflects the items change,
        // proving the `other` insert triggered nothing.
        let batch = next(&mut rx).await.unwrap();
        assert_eq!(batch[0].label, "uno");
        assert!(rx.try_recv().is_err());
    }
}

#[tokio::test]
async fn identical_statements_share_one_subscription() {
    for backend in both() {
        seed(&backend).await;
        let dispatcher = Dispatcher::new();

        let (_first, mut first_rx) = subscribe_items(&dispatcher, &backend, SELECT_ITEMS).await;
        let initial = next(&mut first_rx).await.unwrap();

        // The second subscriber replays the last batch without refetching.
        let (_second, mut second_rx) = subscribe_items(&dispatcher, &backend, SELECT_ITEMS).await;
        let replayed = next(&mut second_rx).await.unwrap();
        assert_eq!(replayed, initial);
        assert_eq!(dispatcher.subscription_count(), 1);
        assert_eq!(backend.active_watches(), 1);

        // Both hear subsequent changes.
        backend
            .execute(&CompiledStatement::new("DELETE FROM items WHERE id = 3"))
            .await
            .unwrap();
        assert_eq!(ids(&next(&mut first_rx).await.unwrap()), vec![1, 2]);
        assert_eq!(ids(&next(&mut second_rx).await.unwrap()), vec![1, 2]);
    }
}

#[tokio::test]
async fn concurrent_identical_subscribes_share_one_subscription() {
    for backend in both() {
        seed(&backend).await;
        let dispatcher = Dispatcher::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let (a, b) = tokio::join!(
            dispatcher.subscribe::<Item, _>(
                &backend,
                CompiledStatement::new(SELECT_ITEMS),
                move |batch| {
                    let _ = tx_a.send(batch);
                },
            ),
            dispatcher.subscribe::<Item, _>(
                &backend,
                CompiledStatement::new(SELECT_ITEMS),
                move |batch| {
                    let _ = tx_b.send(batch);
                },
            ),
        );
        let _a = a.unwrap();
        let _b = b.unwrap();

        assert_eq!(dispatcher.subscription_count(), 1);
        assert_eq!(backend.active_watches(), 1);

        assert_eq!(ids(&next(&mut rx_a).await.unwrap()), vec![1, 2, 3]);
        assert_eq!(ids(&next(&mut rx_b).await.unwrap()), vec![1, 2, 3]);
        assert!(rx_a.try_recv().is_err(), "exactly one initial batch");
        assert!(rx_b.try_recv().is_err(), "exactly one initial batch");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attach_races_never_reorder_deliveries() {
    let backend: Backend = QueueBackend::open_in_memory().unwrap().into();
    for sql in [
        "CREATE TABLE counter (n INTEGER)",
        "INSERT INTO counter (n) VALUES (0)",
    ] {
        backend.execute(&CompiledStatement::new(sql)).await.unwrap();
    }
    let dispatcher = Dispatcher::new();
    const UPDATES: i64 = 60;

    let writer = {
        let backend = backend.clone();
        tokio::spawn(async move {
            for _ in 0..UPDATES {
                backend
                    .execute(&CompiledStatement::new("UPDATE counter SET n = n + 1"))
                    .await
                    .unwrap();
            }
        })
    };

    // Attach listeners while the writer churns; replay-on-attach races the
    // driver's fan-out, and every listener must still see the counter in
    // non-decreasing order.
    let mut handles = Vec::new();
    let mut logs: Vec<Arc<Mutex<Vec<i64>>>> = Vec::new();
    for _ in 0..16 {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let handle = dispatcher
            .subscribe_raw(
                &backend,
                CompiledStatement::new("SELECT n FROM counter"),
                move |outcome| {
                    if let Ok(rows) = outcome {
                        sink.lock().push(rows[0].integer("n").unwrap());
                    }
                },
            )
            .await
            .unwrap();
        handles.push(handle);
        logs.push(log);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    writer.await.unwrap();

    // The final count reaches every listener, by fan-out or by replay.
    timeout(Duration::from_secs(5), async {
        loop {
            if logs.iter().all(|log| log.lock().last() == Some(&UPDATES)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("every listener reaches the final count");

    for log in &logs {
        let seen = log.lock().clone();
        assert!(
            seen.windows(2).all(|w| w[0] <= w[1]),
            "deliveries arrived out of order: {seen:?}"
        );
    }
}

#[tokio::test]
async fn distinct_bindings_are_distinct_subscriptions() {
    let backend: Backend = QueueBackend::open_in_memory().unwrap().into();
    seed(&backend).await;
    let dispatcher = Dispatcher::new();
    let sql = "SELECT id, label FROM items WHERE id > ? ORDER BY id";

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let _a = dispatcher
        .subscribe::<Item, _>(&backend, CompiledStatement::new(sql).bind(1i64), move |b| {
            let _ = tx_a.send(b);
        })
        .await
        .unwrap();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let _b = dispatcher
        .subscribe::<Item, _>(&backend, CompiledStatement::new(sql).bind(2i64), move |b| {
            let _ = tx_b.send(b);
        })
        .await
        .unwrap();

    assert_eq!(dispatcher.subscription_count(), 2);
    assert_eq!(ids(&next(&mut rx_a).await.unwrap()), vec![2, 3]);
    assert_eq!(ids(&next(&mut rx_b).await.unwrap()), vec![3]);

    backend
        .execute(&CompiledStatement::new("INSERT INTO items (id, label) VALUES (4, 'four')"))
        .await
        .unwrap();
    assert_eq!(ids(&next(&mut rx_a).await.unwrap()), vec![2, 3, 4]);
    assert_eq!(ids(&next(&mut rx_b).await.unwrap()), vec![3, 4]);
}

#[tokio::test]
async fn cancelling_the_last_listener_tears_everything_down() {
    for backend in both() {
        seed(&backend).await;
        let dispatcher = Dispatcher::new();

        let (first, mut first_rx) = subscribe_items(&dispatcher, &backend, SELECT_ITEMS).await;
        let (second, mut second_rx) = subscribe_items(&dispatcher, &backend, SELECT_ITEMS).await;
        next(&mut first_rx).await.unwrap();
        next(&mut second_rx).await.unwrap();

        first.cancel();
        assert_eq!(dispatcher.subscription_count(), 1, "one listener remains");
        assert_eq!(backend.active_watches(), 1);

        second.cancel();
        assert_eq!(dispatcher.subscription_count(), 0);
        assert_eq!(backend.active_watches(), 0);

        backend
            .execute(&CompiledStatement::new("DELETE FROM items WHERE id = 1"))
            .await
            .unwrap();
        assert!(first_rx.try_recv().is_err());
        assert!(second_rx.try_recv().is_err());
    }
}

#[tokio::test]
async fn dropping_the_handle_cancels() {
    let backend: Backend = QueueBackend::open_in_memory().unwrap().into();
    seed(&backend).await;
    let dispatcher = Dispatcher::new();

    let (handle, mut rx) = subscribe_items(&dispatcher, &backend, SELECT_ITEMS).await;
    next(&mut rx).await.unwrap();
    drop(handle);

    assert_eq!(dispatcher.subscription_count(), 0);
    assert_eq!(backend.active_watches(), 0);
}

#[tokio::test]
async fn cancel_is_safe_from_inside_a_delivery_callback() {
    let backend: Backend = QueueBackend::open_in_memory().unwrap().into();
    seed(&backend).await;
    let dispatcher = Dispatcher::new();

    let slot: Arc<Mutex<Option<WatchHandle>>> = Arc::new(Mutex::new(None));
    let slot_cb = Arc::clone(&slot);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = dispatcher
        .subscribe_raw(&backend, CompiledStatement::new(SELECT_ITEMS), move |outcome| {
            if let Some(handle) = slot_cb.lock().take() {
                handle.cancel();
            }
            let _ = tx.send(outcome.clone());
        })
        .await
        .unwrap();
    *slot.lock() = Some(handle);

    let first: SharedRows = next(&mut rx).await;
    assert!(first.is_ok());
    assert_eq!(dispatcher.subscription_count(), 0);
    assert_eq!(backend.active_watches(), 0);
}

// ============================================================================
// errors as values
// ============================================================================

#[tokio::test]
async fn decode_failures_are_delivered_per_listener() {
    let backend: Backend = QueueBackend::open_in_memory().unwrap().into();
    seed(&backend).await;
    let dispatcher = Dispatcher::new();

    let (_typed, mut typed_rx) = subscribe_items(&dispatcher, &backend, SELECT_ITEMS).await;
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
    let _raw = dispatcher
        .subscribe_raw(&backend, CompiledStatement::new(SELECT_ITEMS), move |outcome| {
            let _ = raw_tx.send(outcome.clone());
        })
        .await
        .unwrap();
    assert_eq!(dispatcher.subscription_count(), 1, "both listeners share the key");

    next(&mut typed_rx).await.unwrap();
    next(&mut raw_rx).await.unwrap();

    // A NULL label breaks the typed decode but not the raw listener.
    backend
        .execute(&CompiledStatement::new("INSERT INTO items (id, label) VALUES (4, NULL)"))
        .await
        .unwrap();
    let typed_err = next(&mut typed_rx).await.unwrap_err();
    assert!(
        matches!(
            typed_err,
            FreshetError::Decode(DecodeError::UnexpectedNull { .. })
        ),
        "got {typed_err:?}"
    );
    let raw_batch = next(&mut raw_rx).await.unwrap();
    assert_eq!(raw_batch.len(), 4);
    assert!(raw_batch[3].is_null("label"));

    // Fixing the row recovers the typed listener on the next cycle.
    backend
        .execute(&CompiledStatement::new("UPDATE items SET label = 'four' WHERE id = 4"))
        .await
        .unwrap();
    let recovered = next(&mut typed_rx).await.unwrap();
    assert_eq!(ids(&recovered), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn subscribe_one_delivers_not_found_then_recovers() {
    let backend: Backend = QueueBackend::open_in_memory().unwrap().into();
    seed(&backend).await;
    let dispatcher = Dispatcher::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = dispatcher
        .subscribe_one::<Item, _>(
            &backend,
            CompiledStatement::new("SELECT id, label FROM items WHERE id = ?").bind(99i64),
            move |item| {
                let _ = tx.send(item);
            },
        )
        .await
        .unwrap();

    let initial = next(&mut rx).await;
    assert!(matches!(initial, Err(FreshetError::NotFound)), "got {initial:?}");

    backend
        .execute(&CompiledStatement::new("INSERT INTO items (id, label) VALUES (99, 'found')"))
        .await
        .unwrap();
    let found = next(&mut rx).await.unwrap();
    assert_eq!(found, Item { id: 99, label: "found".into() });
}

#[tokio::test]
async fn failed_initial_fetch_is_a_value_and_the_subscription_survives() {
    let backend: Backend = QueueBackend::open_in_memory().unwrap().into();
    seed(&backend).await;
    let dispatcher = Dispatcher::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = dispatcher
        .subscribe_raw(
            &backend,
            CompiledStatement::new("SELECT n FROM missing_t"),
            move |outcome| {
                let _ = tx.send(outcome.clone());
            },
        )
        .await
        .expect("subscribe succeeds even when the statement cannot run yet");

    let initial = next(&mut rx).await;
    assert!(matches!(initial, Err(FreshetError::Execution(_))), "got {initial:?}");
    assert_eq!(dispatcher.subscription_count(), 1);

    // Once the table exists and changes, the same subscription recovers.
    backend
        .execute(&CompiledStatement::new("CREATE TABLE missing_t (n INTEGER)"))
        .await
        .unwrap();
    backend
        .execute(&CompiledStatement::new("INSERT INTO missing_t (n) VALUES (5)"))
        .await
        .unwrap();
    let recovered = next(&mut rx).await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].integer("n").unwrap(), 5);
}

#[tokio::test]
async fn panicking_listener_does_not_block_the_rest() {
    let backend: Backend = QueueBackend::open_in_memory().unwrap().into();
    seed(&backend).await;
    let dispatcher = Dispatcher::new();

    let _bad = dispatcher
        .subscribe_raw(&backend, CompiledStatement::new(SELECT_ITEMS), |_outcome| {
            panic!("listener bug");
        })
        .await
        .unwrap();
    let (_good, mut rx) = subscribe_items(&dispatcher, &backend, SELECT_ITEMS).await;

    assert_eq!(ids(&next(&mut rx).await.unwrap()), vec![1, 2, 3]);

    backend
        .execute(&CompiledStatement::new("DELETE FROM items WHERE id = 2"))
        .await
        .unwrap();
    assert_eq!(ids(&next(&mut rx).await.unwrap()), vec![1, 3]);
}

#[tokio::test]
async fn panicking_replay_still_returns_a_working_handle() {
    for backend in both() {
        seed(&backend).await;
        let dispatcher = Dispatcher::new();

        let (keeper, mut rx) = subscribe_items(&dispatcher, &backend, SELECT_ITEMS).await;
        next(&mut rx).await.unwrap();

        // The replayed batch makes this callback panic during subscribe;
        // the attach must still hand back a handle that can detach.
        let bomb = dispatcher
            .subscribe_raw(&backend, CompiledStatement::new(SELECT_ITEMS), |_outcome| {
                panic!("listener bug");
            })
            .await
            .unwrap();
        assert_eq!(dispatcher.subscription_count(), 1);

        // The shared subscription stays healthy for the other listener.
        backend
            .execute(&CompiledStatement::new("DELETE FROM items WHERE id = 1"))
            .await
            .unwrap();
        assert_eq!(ids(&next(&mut rx).await.unwrap()), vec![2, 3]);

        bomb.cancel();
        keeper.cancel();
        assert_eq!(dispatcher.subscription_count(), 0);
        assert_eq!(backend.active_watches(), 0);
    }
}
