//! Per-entity lanes: batching, parallelism, idle teardown and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_core::{handler_fn, HandlerDescriptor, RawEvent, ReactorBuilder, ReactorHandle, Registry};
use keel_outbox::Outbox;
use keel_testing::fixtures::{fast_settings, identity, widget};
use keel_testing::{wait_until, HandlerRecorder};
use serde_json::json;

const LIMIT: Duration = Duration::from_secs(5);

fn start(registry: Registry) -> ReactorHandle {
    ReactorBuilder::new(registry)
        .with_settings(fast_settings())
        .build()
        .start()
}

// ============================================================================
// Batching
// ============================================================================

#[tokio::test(start_paused = true)]
async fn bursts_collapse_to_the_newest_body() {
    let recorder = HandlerRecorder::new();
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_create("create", recorder.succeed()))
        .build()
        .unwrap();
    let handle = start(registry);

    for size in 1..=5 {
        handle.dispatch(RawEvent::modified(widget("w1", json!({"size": size}))));
    }

    assert!(wait_until(LIMIT, || recorder.calls("create") == 1).await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(recorder.calls("create"), 1);
    assert_eq!(recorder.last("create").unwrap().body["spec"]["size"], json!(5));

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn entities_are_handled_in_parallel() {
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finished);
    let slow = handler_fn(move |_ctx| {
        let counter = Arc::clone(&counter);
        async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    });
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_create("slow", slow))
        .build()
        .unwrap();
    let handle = start(registry);

    for name in ["w1", "w2", "w3"] {
        handle.dispatch(RawEvent::added(widget(name, json!({}))));
    }
    assert_eq!(handle.active_lanes(), 3);

    assert!(wait_until(Duration::from_secs(6), || finished.load(Ordering::SeqCst) == 3).await);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn notifications_during_the_consistency_wait_collapse() {
    let recorder = HandlerRecorder::new();
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_create("create", recorder.returning(json!({"ready": true}))))
        .with_handler(HandlerDescriptor::on_update("update", recorder.succeed()))
        .build()
        .unwrap();
    let mut settings = fast_settings();
    settings.persistence.consistency_timeout = Duration::from_secs(5);
    let outbox = Arc::new(Outbox::new());
    let handle = ReactorBuilder::new(registry)
        .with_settings(settings)
        .with_shared_sink(outbox.clone())
        .build()
        .start();

    // No forwarding: the echo of our own patch never arrives, so the lane
    // keeps waiting for it.
    let created = outbox.create(widget("w1", json!({"size": 1}))).unwrap();
    handle.dispatch(RawEvent::added(created));
    assert!(wait_until(LIMIT, || recorder.calls("create") == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.dispatch(RawEvent::modified(widget("w1", json!({"size": 2}))));
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.dispatch(RawEvent::modified(widget("w1", json!({"size": 3}))));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(recorder.calls("update"), 0);

    assert!(wait_until(LIMIT, || recorder.calls("update") == 1).await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(recorder.calls("update"), 1);
    assert_eq!(recorder.last("update").unwrap().body["spec"]["size"], json!(3));

    handle.shutdown().await;
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn idle_lanes_are_released_and_recreated() {
    let recorder = HandlerRecorder::new();
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_create("create", recorder.succeed()))
        .with_handler(HandlerDescriptor::on_event("watch", recorder.succeed()))
        .build()
        .unwrap();
    let handle = start(registry);

    handle.dispatch(RawEvent::added(widget("w1", json!({}))));
    assert!(wait_until(LIMIT, || recorder.calls("create") == 1).await);
    assert_eq!(handle.active_lanes(), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(handle.active_lanes(), 0);

    handle.dispatch(RawEvent::modified(widget("w1", json!({}))));
    assert!(wait_until(LIMIT, || recorder.calls("watch") == 2).await);
    assert_eq!(recorder.calls("create"), 1);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn end_of_stream_releases_the_lane() {
    let recorder = HandlerRecorder::new();
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_create("create", recorder.succeed()))
        .build()
        .unwrap();
    let handle = start(registry);

    handle.dispatch(RawEvent::added(widget("w1", json!({}))));
    handle.end_of_stream(&identity("w1"));

    assert!(wait_until(LIMIT, || handle.active_lanes() == 0).await);
    assert_eq!(recorder.calls("create"), 1);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_busy_workers() {
    let recorder = HandlerRecorder::new();
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_create("stuck", recorder.sleep(Duration::from_secs(3600))))
        .build()
        .unwrap();
    let handle = start(registry);

    handle.dispatch(RawEvent::added(widget("w1", json!({}))));
    handle.dispatch(RawEvent::added(widget("w2", json!({}))));
    assert!(wait_until(LIMIT, || recorder.calls("stuck") == 2).await);

    let started = tokio::time::Instant::now();
    handle.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(handle.active_lanes(), 0);
    assert!(handle.reactor().is_shutting_down());

    handle.dispatch(RawEvent::added(widget("w3", json!({}))));
    assert_eq!(handle.active_lanes(), 0);
}
