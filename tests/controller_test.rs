//! End-to-end tests for the controller: store -> cache -> queue -> workers.

use async_trait::async_trait;
use expression_resolver::api::{MemoryStore, ResourceApi};
use expression_resolver::cache::InformerConfig;
use expression_resolver::controller::{Controller, ControllerConfig, ErrorSink};
use expression_resolver::error::{Error, ReconcileError};
use expression_resolver::event::ChangeEvent;
use expression_resolver::model::{Expression, ExpressionSpec, NewExpression, ObjectKey};
use expression_resolver::queue::{ExponentialFailureRateLimiter, WorkQueue};
use expression_resolver::reconcile::{ExpressionReconciler, Reconciler};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn key(name: &str) -> ObjectKey {
    ObjectKey::new("default", name)
}

fn test_config() -> ControllerConfig {
    ControllerConfig {
        max_retries: 3,
        informer: InformerConfig {
            resync_interval: Duration::ZERO,
            ..InformerConfig::default()
        },
    }
}

fn fast_queue() -> WorkQueue<ChangeEvent> {
    WorkQueue::new(
        "test",
        ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_millis(10)),
    )
}

#[derive(Default)]
struct CollectingSink {
    failures: Mutex<Vec<(ObjectKey, &'static str)>>,
}

impl CollectingSink {
    fn failures(&self) -> Vec<(ObjectKey, &'static str)> {
        self.failures.lock().clone()
    }
}

impl ErrorSink for CollectingSink {
    fn handle_error(&self, key: &ObjectKey, err: &ReconcileError) {
        self.failures.lock().push((key.clone(), err.kind()));
    }
}

/// Counts every reconcile before delegating.
struct Counting {
    inner: ExpressionReconciler,
    attempts: AtomicUsize,
}

impl Counting {
    fn new(api: Arc<dyn ResourceApi>) -> Self {
        Self {
            inner: ExpressionReconciler::new(api),
            attempts: AtomicUsize::new(0),
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reconciler for Counting {
    async fn reconcile(&self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.reconcile(event).await
    }

    fn has_changed(&self, old: &Expression, new: &Expression) -> bool {
        self.inner.has_changed(old, new)
    }
}

fn spawn_controller(
    controller: Controller,
    workers: usize,
) -> (CancellationToken, JoinHandle<Result<(), Error>>) {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move { controller.run(token, workers).await });
    (cancel, task)
}

async fn stop(cancel: CancellationToken, task: JoinHandle<Result<(), Error>>) {
    cancel.cancel();
    timeout(Duration::from_secs(2), task)
        .await
        .expect("controller did not stop")
        .unwrap()
        .unwrap();
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn result_of(store: &MemoryStore, name: &str) -> Option<String> {
    store.lookup(&key(name)).and_then(|item| item.status.result)
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_expression_gets_its_result() {
    let store = Arc::new(MemoryStore::new());
    store
        .create(NewExpression::new("sum", "x+y").data(r#"{"x":2,"y":3}"#))
        .unwrap();

    let controller = Controller::new(
        store.clone(),
        Arc::new(ExpressionReconciler::new(store.clone())),
        test_config(),
    );
    let (cancel, task) = spawn_controller(controller, 1);

    eventually(|| result_of(&store, "sum").as_deref() == Some("5")).await;

    // A data change is reconciled again.
    store
        .update_spec(
            &key("sum"),
            ExpressionSpec {
                data: r#"{"x":4,"y":3}"#.to_string(),
                body: "x+y".to_string(),
            },
        )
        .unwrap();
    eventually(|| result_of(&store, "sum").as_deref() == Some("7")).await;

    stop(cancel, task).await;
}

#[tokio::test]
async fn expressions_created_after_start_are_resolved() {
    let store = Arc::new(MemoryStore::new());
    let controller = Controller::new(
        store.clone(),
        Arc::new(ExpressionReconciler::new(store.clone())),
        test_config(),
    );
    let (cancel, task) = spawn_controller(controller, 2);

    for (name, body) in [("a", "1 + 1"), ("b", "'x' + 'y'"), ("c", "3 > 2")] {
        store.create(NewExpression::new(name, body)).unwrap();
    }
    eventually(|| {
        result_of(&store, "a").as_deref() == Some("2")
            && result_of(&store, "b").as_deref() == Some("xy")
            && result_of(&store, "c").as_deref() == Some("true")
    })
    .await;

    stop(cancel, task).await;
}

/// Only reacts to data changes.
struct DataOnly(Counting);

#[async_trait]
impl Reconciler for DataOnly {
    async fn reconcile(&self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        self.0.reconcile(event).await
    }

    fn has_changed(&self, old: &Expression, new: &Expression) -> bool {
        old.spec.data != new.spec.data
    }
}

#[tokio::test]
async fn updates_the_predicate_rejects_are_not_reconciled() {
    let store = Arc::new(MemoryStore::new());
    store
        .create(NewExpression::new("sum", "x+y").data(r#"{"x":2,"y":3}"#))
        .unwrap();

    let reconciler = Arc::new(DataOnly(Counting::new(store.clone())));
    let controller = Controller::new(store.clone(), reconciler.clone(), test_config());
    let (cancel, task) = spawn_controller(controller.clone(), 1);
    eventually(|| result_of(&store, "sum").as_deref() == Some("5")).await;

    store
        .update_spec(
            &key("sum"),
            ExpressionSpec {
                data: r#"{"x":2,"y":3}"#.to_string(),
                body: "x*y".to_string(),
            },
        )
        .unwrap();
    eventually(|| {
        controller
            .informer()
            .get(&key("sum"))
            .is_some_and(|item| item.spec.body == "x*y")
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(result_of(&store, "sum").as_deref(), Some("5"));
    assert_eq!(reconciler.0.attempts(), 1);

    stop(cancel, task).await;
}

#[tokio::test]
async fn own_status_write_does_not_trigger_another_reconcile() {
    let store = Arc::new(MemoryStore::new());
    store.create(NewExpression::new("one", "1")).unwrap();

    let reconciler = Arc::new(Counting::new(store.clone()));
    let controller = Controller::new(store.clone(), reconciler.clone(), test_config());
    let (cancel, task) = spawn_controller(controller, 1);

    eventually(|| result_of(&store, "one").as_deref() == Some("1")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reconciler.attempts(), 1);

    stop(cancel, task).await;
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let item = store
        .create(NewExpression::new("sum", "x+y").data(r#"{"x":2,"y":3}"#))
        .unwrap();
    let reconciler = ExpressionReconciler::new(store.clone());
    let event = ChangeEvent::Added(item);

    reconciler.reconcile(&event).await.unwrap();
    let first = store.lookup(&key("sum")).unwrap();
    assert_eq!(first.status.result.as_deref(), Some("5"));

    reconciler.reconcile(&event).await.unwrap();
    let second = store.lookup(&key("sum")).unwrap();
    assert_eq!(second, first);
}

#[tokio::test]
async fn reconcile_of_a_deleted_item_is_a_no_op() {
    let store = Arc::new(MemoryStore::new());
    let item = store.create(NewExpression::new("gone", "1")).unwrap();
    store.delete(&key("gone")).unwrap();

    let reconciler = ExpressionReconciler::new(store.clone());
    reconciler.reconcile(&ChangeEvent::Added(item)).await.unwrap();
    assert!(store.lookup(&key("gone")).is_none());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_data_is_retried_then_reported() {
    let store = Arc::new(MemoryStore::new());
    store
        .create(NewExpression::new("broken", "x+y").data("{x:2"))
        .unwrap();

    let reconciler = Arc::new(Counting::new(store.clone()));
    let sink = Arc::new(CollectingSink::default());
    let controller = Controller::with_parts(
        store.clone(),
        reconciler.clone(),
        fast_queue(),
        sink.clone(),
        test_config(),
    );
    let (cancel, task) = spawn_controller(controller.clone(), 1);

    eventually(|| !sink.failures().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // One initial attempt plus max_retries requeues.
    assert_eq!(reconciler.attempts(), 4);
    assert_eq!(sink.failures(), vec![(key("broken"), "invalid_data")]);
    assert_eq!(result_of(&store, "broken"), None);
    assert_eq!(controller.queue().num_requeues(&key("broken")), 0);

    stop(cancel, task).await;
}

#[tokio::test]
async fn failure_of_one_item_does_not_block_others() {
    let store = Arc::new(MemoryStore::new());
    store.create(NewExpression::new("bad", "1 / 0")).unwrap();
    store.create(NewExpression::new("good", "6 * 7")).unwrap();

    let sink = Arc::new(CollectingSink::default());
    let controller = Controller::with_parts(
        store.clone(),
        Arc::new(ExpressionReconciler::new(store.clone())),
        fast_queue(),
        sink.clone(),
        test_config(),
    );
    let (cancel, task) = spawn_controller(controller, 1);

    eventually(|| result_of(&store, "good").as_deref() == Some("42")).await;
    eventually(|| !sink.failures().is_empty()).await;
    assert_eq!(sink.failures(), vec![(key("bad"), "evaluation")]);

    stop(cancel, task).await;
}

#[tokio::test]
async fn deeply_nested_body_is_reported_not_fatal() {
    let depth = 5_000;
    let body = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
    let store = Arc::new(MemoryStore::new());
    store.create(NewExpression::new("deep", body)).unwrap();
    store.create(NewExpression::new("flat", "1 + 1")).unwrap();

    let sink = Arc::new(CollectingSink::default());
    let controller = Controller::with_parts(
        store.clone(),
        Arc::new(ExpressionReconciler::new(store.clone())),
        fast_queue(),
        sink.clone(),
        test_config(),
    );
    let (cancel, task) = spawn_controller(controller, 1);

    eventually(|| !sink.failures().is_empty()).await;
    assert_eq!(sink.failures(), vec![(key("deep"), "evaluation")]);
    assert_eq!(result_of(&store, "deep"), None);
    eventually(|| result_of(&store, "flat").as_deref() == Some("2")).await;

    stop(cancel, task).await;
}

#[tokio::test]
async fn item_recreated_during_a_watch_gap_is_resolved() {
    // A one-slot history makes the watch lag and fall back to relisting.
    let store = Arc::new(MemoryStore::with_history_limit(1));
    store
        .create(NewExpression::new("a", "x+y").data(r#"{"x":2,"y":3}"#))
        .unwrap();

    let config = ControllerConfig {
        informer: InformerConfig {
            resync_interval: Duration::ZERO,
            reconnect_base: Duration::from_millis(5),
            reconnect_max: Duration::from_millis(20),
        },
        ..test_config()
    };
    let controller = Controller::new(
        store.clone(),
        Arc::new(ExpressionReconciler::new(store.clone())),
        config,
    );
    let (cancel, task) = spawn_controller(controller, 1);
    eventually(|| result_of(&store, "a").as_deref() == Some("5")).await;

    let old_uid = store.lookup(&key("a")).unwrap().metadata.uid;
    store.delete(&key("a")).unwrap();
    store
        .create(NewExpression::new("a", "x+y").data(r#"{"x":2,"y":3}"#))
        .unwrap();
    store.create(NewExpression::new("b", "1")).unwrap();
    store.create(NewExpression::new("c", "2")).unwrap();

    eventually(|| {
        result_of(&store, "a").as_deref() == Some("5")
            && result_of(&store, "b").as_deref() == Some("1")
            && result_of(&store, "c").as_deref() == Some("2")
    })
    .await;
    assert_ne!(store.lookup(&key("a")).unwrap().metadata.uid, old_uid);

    stop(cancel, task).await;
}

/// Panics on its first reconcile, then behaves.
struct PanicOnce {
    inner: ExpressionReconciler,
    panicked: AtomicUsize,
}

#[async_trait]
impl Reconciler for PanicOnce {
    async fn reconcile(&self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        if self.panicked.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("boom");
        }
        self.inner.reconcile(event).await
    }
}

#[tokio::test]
async fn panicking_reconcile_is_caught_and_retried() {
    let store = Arc::new(MemoryStore::new());
    store.create(NewExpression::new("p", "2 + 2")).unwrap();

    let reconciler = Arc::new(PanicOnce {
        inner: ExpressionReconciler::new(store.clone()),
        panicked: AtomicUsize::new(0),
    });
    let sink = Arc::new(CollectingSink::default());
    let controller = Controller::with_parts(
        store.clone(),
        reconciler,
        fast_queue(),
        sink.clone(),
        test_config(),
    );
    let (cancel, task) = spawn_controller(controller, 1);

    eventually(|| result_of(&store, "p").as_deref() == Some("4")).await;
    assert!(sink.failures().is_empty());

    stop(cancel, task).await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Blocks every reconcile until the gate opens.
struct Gated {
    gate: Semaphore,
    started: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl Reconciler for Gated {
    async fn reconcile(&self, _event: &ChangeEvent) -> Result<(), ReconcileError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.unwrap();
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_drains_in_flight_work_and_takes_nothing_new() {
    let store = Arc::new(MemoryStore::new());
    store.create(NewExpression::new("a", "1")).unwrap();
    store.create(NewExpression::new("b", "2")).unwrap();

    let reconciler = Arc::new(Gated {
        gate: Semaphore::new(0),
        started: AtomicUsize::new(0),
        finished: AtomicUsize::new(0),
    });
    let controller = Controller::new(store.clone(), reconciler.clone(), test_config());
    let (cancel, task) = spawn_controller(controller, 4);

    eventually(|| reconciler.started.load(Ordering::SeqCst) == 2).await;
    cancel.cancel();

    // Still waiting on the two in-flight reconciles.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    store.create(NewExpression::new("late", "3")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    reconciler.gate.add_permits(10);
    timeout(Duration::from_secs(2), task)
        .await
        .expect("controller did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(reconciler.started.load(Ordering::SeqCst), 2);
    assert_eq!(reconciler.finished.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn zero_workers_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let controller = Controller::new(
        store.clone(),
        Arc::new(ExpressionReconciler::new(store)),
        test_config(),
    );
    let err = controller.run(CancellationToken::new(), 0).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn cancel_before_cache_sync_is_an_error() {
    let store = Arc::new(MemoryStore::new());
    store.set_available(false);
    let controller = Controller::new(
        store.clone(),
        Arc::new(ExpressionReconciler::new(store.clone())),
        test_config(),
    );
    let (cancel, task) = spawn_controller(controller.clone(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let result = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::CacheSync)));
    assert!(controller.queue().is_shutting_down());
}
