//! Integration tests for the subscription manager: subscribe, tick, teardown.
//!
//! Callbacks that must stay busy block on a gate channel instead of sleeping,
//! so every test releases its callback before the runtime shuts down.

use chrono::Utc;
use gbfs_loader::{
    Delivery, GbfsVersion, RefreshPanicked, SubscribeError, SubscriptionManager,
    SubscriptionOptions, UnsubscribeError, UpdateInterceptor,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A v3 system with one station_status feed that is always due.
async fn v3_system() -> MockServer {
    let server = MockServer::start().await;
    let discovery = format!(
        r#"{{"last_updated": "2024-01-01T00:00:00Z", "ttl": 0, "version": "3.0", "data": {{"feeds": [
            {{"name": "system_information", "url": "{0}/system_information.json"}},
            {{"name": "station_status", "url": "{0}/station_status.json"}}
        ]}}}}"#,
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/gbfs.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(discovery))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/system_information.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"last_updated": "2024-01-01T00:00:00Z", "ttl": 3600, "version": "3.0", "data": {"system_id": "test"}}"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/station_status.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"{{"last_updated": {}, "ttl": 0, "version": "3.0", "data": {{"stations": [{{"station_id": "s1"}}]}}}}"#,
            Utc::now().timestamp()
        )))
        .mount(&server)
        .await;
    server
}

fn options(server: &MockServer) -> SubscriptionOptions {
    SubscriptionOptions::new(Url::parse(&format!("{}/gbfs.json", server.uri())).unwrap())
}

/// Callback that reports when it starts, then blocks until the gate opens
/// (or a minute passes).
fn gated_callback() -> (
    impl Fn(Delivery) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<()>,
    std_mpsc::Sender<()>,
) {
    let (started_tx, started_rx) = mpsc::unbounded_channel();
    let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
    let gate_rx = Mutex::new(gate_rx);
    let callback = move |_: Delivery| {
        let _ = started_tx.send(());
        let _ = gate_rx.lock().unwrap().recv_timeout(Duration::from_secs(60));
    };
    (callback, started_rx, gate_tx)
}

// ============================================================================
// Subscribe
// ============================================================================

#[tokio::test]
async fn test_tick_delivers_snapshot() {
    let server = v3_system().await;
    let manager = SubscriptionManager::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let id = manager
        .subscribe_v3(options(&server), move |delivery: Delivery| {
            let _ = tx.send(delivery);
        })
        .await
        .unwrap();
    assert!(manager.contains(&id));
    assert_eq!(manager.len(), 1);

    manager.update();
    let delivery = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(delivery.version(), GbfsVersion::V3);
    assert_eq!(
        delivery
            .station_status()
            .and_then(|s| s.records("stations"))
            .map(<[_]>::len),
        Some(1)
    );
    assert!(delivery.system_information().is_some());
    assert!(delivery.vehicle_status().is_none());

    manager.unsubscribe_async(&id).await.unwrap();
}

#[tokio::test]
async fn test_unreachable_and_misconfigured_subscriptions_rejected() {
    let manager = SubscriptionManager::new();

    let unreachable = SubscriptionOptions::new(Url::parse("http://127.0.0.1:1/gbfs.json").unwrap());
    let result = manager.subscribe_v2(unreachable, |_: Delivery| {}).await;
    assert!(matches!(result, Err(SubscribeError::Unreachable(_))));

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gbfs.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"last_updated": 1, "ttl": 0, "version": "2.3", "data": {"nb": {"feeds": []}}}"#,
        ))
        .mount(&server)
        .await;
    let result = manager
        .subscribe_v2(options(&server).with_language("en"), |_: Delivery| {})
        .await;
    assert!(matches!(result, Err(SubscribeError::Configuration(_))));

    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_update_one_targets_single_subscription() {
    let server = v3_system().await;
    let manager = SubscriptionManager::new();
    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&first_calls);
    let first = manager
        .subscribe_v3(options(&server), move |_: Delivery| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    let counter = Arc::clone(&second_calls);
    let second = manager
        .subscribe_v3(options(&server), move |_: Delivery| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    assert!(manager.update_one(&first));
    manager.unsubscribe_async(&first).await.unwrap();
    manager.unsubscribe_async(&second).await.unwrap();

    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
}

#[derive(Default)]
struct CountingInterceptor {
    before: AtomicUsize,
    after: AtomicUsize,
}

impl UpdateInterceptor for CountingInterceptor {
    fn before_update(&self) {
        self.before.fetch_add(1, Ordering::SeqCst);
    }
    fn after_update(&self) {
        self.after.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_interceptor_brackets_each_update() {
    let server = v3_system().await;
    let manager = SubscriptionManager::new();
    let interceptor = Arc::new(CountingInterceptor::default());

    let id = manager
        .subscribe_with_interceptor(
            GbfsVersion::V3,
            options(&server),
            |_: Delivery| {},
            Some(interceptor.clone()),
        )
        .await
        .unwrap();

    for _ in 0..3 {
        manager.update();
        // Wait for this tick before starting the next, so none is skipped
        manager
            .subscription(&id)
            .unwrap()
            .current_refresh()
            .wait()
            .await
            .unwrap();
    }
    manager.unsubscribe_async(&id).await.unwrap();

    assert_eq!(interceptor.before.load(Ordering::SeqCst), 3);
    assert_eq!(interceptor.after.load(Ordering::SeqCst), 3);
}

// ============================================================================
// Unsubscribe
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_waits_for_running_callback() {
    let server = v3_system().await;
    let manager = SubscriptionManager::new();
    let (callback, mut started, gate) = gated_callback();
    let id = manager.subscribe_v3(options(&server), callback).await.unwrap();

    manager.update();
    tokio::time::timeout(Duration::from_secs(5), started.recv())
        .await
        .unwrap()
        .unwrap();

    let unsubscribe = tokio::spawn(manager.unsubscribe_async(&id));
    // Removed right away, even though the refresh is still running
    assert!(!manager.contains(&id));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!unsubscribe.is_finished());

    gate.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), unsubscribe)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Ok(()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_times_out_on_stuck_callback() {
    let server = v3_system().await;
    let manager = SubscriptionManager::new();
    let (callback, mut started, gate) = gated_callback();
    let id = manager.subscribe_v3(options(&server), callback).await.unwrap();

    manager.update();
    tokio::time::timeout(Duration::from_secs(5), started.recv())
        .await
        .unwrap()
        .unwrap();

    let timeout = Duration::from_secs(1);
    let start = Instant::now();
    let result = manager.unsubscribe_async_with_timeout(&id, timeout).await;
    let elapsed = start.elapsed();

    assert_eq!(result, Err(UnsubscribeError::Timeout(timeout)));
    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");

    gate.send(()).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_reports_panicked_refresh() {
    let server = v3_system().await;
    let manager = SubscriptionManager::new();
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let (gate, gate_rx) = std_mpsc::channel::<()>();
    let gate_rx = Mutex::new(gate_rx);
    let id = manager
        .subscribe_v3(options(&server), move |_: Delivery| {
            let _ = started_tx.send(());
            let _ = gate_rx.lock().unwrap().recv_timeout(Duration::from_secs(60));
            panic!("subscriber bug");
        })
        .await
        .unwrap();

    manager.update();
    tokio::time::timeout(Duration::from_secs(5), started.recv())
        .await
        .unwrap()
        .unwrap();

    let unsubscribe = tokio::spawn(manager.unsubscribe_async(&id));
    gate.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), unsubscribe)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        result,
        Err(UnsubscribeError::RefreshPanicked(RefreshPanicked { count: 1 }))
    );
    assert!(!manager.contains(&id));
}

#[tokio::test]
async fn test_unsubscribe_without_refresh_in_flight() {
    let server = v3_system().await;
    let manager = SubscriptionManager::new();
    let id = manager
        .subscribe_v3(options(&server), |_: Delivery| {})
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_millis(100), manager.unsubscribe_async(&id))
        .await
        .unwrap();
    assert_eq!(result, Ok(()));

    // Already gone: resolves immediately, and no further refresh is dispatched
    assert_eq!(manager.unsubscribe_async(&id).await, Ok(()));
    assert!(!manager.update_one(&id));
    assert!(manager.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[allow(deprecated)]
async fn test_blocking_unsubscribe_on_multi_thread_runtime() {
    let server = v3_system().await;
    let manager = SubscriptionManager::new();
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    let id = manager
        .subscribe_v3(options(&server), move |_: Delivery| {
            std::thread::sleep(Duration::from_millis(100));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    manager.update();
    assert_eq!(manager.unsubscribe(&id), Ok(()));
    // The dispatched refresh finished before unsubscribe returned
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Custom runtime
// ============================================================================

#[test]
fn test_refreshes_run_on_supplied_runtime() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("gbfs-custom-pool")
        .enable_all()
        .build()
        .unwrap();

    let server = runtime.block_on(v3_system());
    let manager = SubscriptionManager::new().with_runtime(runtime.handle().clone());

    let (tx, rx) = std_mpsc::channel();
    let id = runtime
        .block_on(manager.subscribe_v3(options(&server), move |_: Delivery| {
            let name = std::thread::current().name().map(str::to_owned);
            let _ = tx.send(name);
        }))
        .unwrap();

    // Called from a plain thread: the manager dispatches onto its own runtime
    manager.update();
    let thread_name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(thread_name.as_deref(), Some("gbfs-custom-pool"));

    runtime.block_on(manager.unsubscribe_async(&id)).unwrap();
}
