//! Finalizers and deletion handling, through an outbox that honours them.

use std::sync::Arc;
use std::time::Duration;

use keel_core::{
    has_finalizer, is_deletion_ongoing, Clock, HandlerDescriptor, RawEvent, ReactorBuilder,
    ReactorHandle, Reason, Registry,
};
use keel_outbox::Outbox;
use keel_persistence::AnnotationsProgressStore;
use keel_testing::fixtures::{fast_settings, identity, widget};
use keel_testing::{wait_until, HandlerRecorder};
use serde_json::json;
use tokio::task::JoinHandle;

const LIMIT: Duration = Duration::from_secs(5);
const FINALIZER: &str = "keel.dev/finalizer";

fn start(registry: Registry) -> (Arc<Outbox>, ReactorHandle, JoinHandle<()>) {
    let outbox = Arc::new(Outbox::new());
    let handle = ReactorBuilder::new(registry)
        .with_settings(fast_settings())
        .with_shared_sink(outbox.clone())
        .build()
        .start();
    let forwarder = outbox.forward_to(handle.clone());
    (outbox, handle, forwarder)
}

// ============================================================================
// Finalizer flow
// ============================================================================

#[tokio::test(start_paused = true)]
async fn deletion_handlers_run_before_removal() {
    let recorder = HandlerRecorder::new();
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_create("create", recorder.succeed()))
        .with_handler(HandlerDescriptor::on_delete("cleanup", recorder.succeed()))
        .build()
        .unwrap();
    let (outbox, handle, forwarder) = start(registry);
    let id = identity("w1");

    outbox.create(widget("w1", json!({"size": 1}))).unwrap();
    assert!(
        wait_until(LIMIT, || {
            outbox.get(&id).is_some_and(|body| has_finalizer(&body, FINALIZER))
        })
        .await
    );
    assert_eq!(recorder.calls("create"), 1);

    outbox.delete(&id).unwrap();
    assert!(wait_until(LIMIT, || !outbox.contains(&id)).await);
    assert_eq!(recorder.calls("cleanup"), 1);
    assert_eq!(recorder.last("cleanup").unwrap().reason, Reason::Delete);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(recorder.total_calls(), 2);

    handle.shutdown().await;
    forwarder.abort();
}

#[tokio::test(start_paused = true)]
async fn failing_deletion_handlers_hold_the_finalizer() {
    let recorder = HandlerRecorder::new();
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_delete(
            "cleanup",
            recorder.fail_temporarily(2, Duration::from_secs(5)),
        ))
        .build()
        .unwrap();
    let (outbox, handle, forwarder) = start(registry);
    let id = identity("w1");

    outbox.create(widget("w1", json!({}))).unwrap();
    assert!(
        wait_until(LIMIT, || {
            outbox.get(&id).is_some_and(|body| has_finalizer(&body, FINALIZER))
        })
        .await
    );

    outbox.delete(&id).unwrap();
    assert!(wait_until(LIMIT, || recorder.calls("cleanup") == 1).await);
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(outbox.contains(&id));

    assert!(wait_until(Duration::from_secs(10), || !outbox.contains(&id)).await);
    assert_eq!(recorder.calls("cleanup"), 3);

    handle.shutdown().await;
    forwarder.abort();
}

#[tokio::test(start_paused = true)]
async fn optional_deletion_handlers_add_no_finalizer() {
    let recorder = HandlerRecorder::new();
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_create("create", recorder.succeed()))
        .with_handler(HandlerDescriptor::on_delete("cleanup", recorder.succeed()).optional())
        .build()
        .unwrap();
    let (outbox, handle, forwarder) = start(registry);
    let id = identity("w1");

    outbox.create(widget("w1", json!({}))).unwrap();
    assert!(wait_until(LIMIT, || recorder.calls("create") == 1).await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!has_finalizer(&outbox.get(&id).unwrap(), FINALIZER));

    // Gone at once; the handler still gets its single pass.
    outbox.delete(&id).unwrap();
    assert!(!outbox.contains(&id));
    assert!(wait_until(LIMIT, || recorder.calls("cleanup") == 1).await);

    handle.shutdown().await;
    forwarder.abort();
}

#[tokio::test(start_paused = true)]
async fn foreign_finalizers_do_not_repeat_deletion_handlers() {
    let recorder = HandlerRecorder::new();
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_delete("cleanup", recorder.succeed()))
        .build()
        .unwrap();
    let clock = Clock::new();
    let outbox = Arc::new(Outbox::new());
    let handle = ReactorBuilder::new(registry)
        .with_settings(fast_settings())
        .with_clock(clock)
        .with_store(AnnotationsProgressStore::new(clock, "keel.dev"))
        .with_shared_sink(outbox.clone())
        .build()
        .start();
    let forwarder = outbox.forward_to(handle.clone());
    let id = identity("w1");

    let mut body = widget("w1", json!({}));
    body["metadata"]["finalizers"] = json!(["other.io/hold"]);
    outbox.create(body).unwrap();
    assert!(
        wait_until(LIMIT, || {
            outbox.get(&id).is_some_and(|body| has_finalizer(&body, FINALIZER))
        })
        .await
    );

    outbox.delete(&id).unwrap();
    assert!(wait_until(LIMIT, || recorder.calls("cleanup") == 1).await);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(recorder.calls("cleanup"), 1);

    // Still held by the other finalizer, with the deletion marked as handled.
    let held = outbox.get(&id).unwrap();
    assert!(is_deletion_ongoing(&held));
    assert!(!has_finalizer(&held, FINALIZER));
    assert!(has_finalizer(&held, "other.io/hold"));
    assert_eq!(
        held.pointer("/metadata/annotations/keel.dev~1deletion-handled"),
        Some(&json!("true"))
    );

    handle.shutdown().await;
    forwarder.abort();
}

// ============================================================================
// Unblocked deletions
// ============================================================================

#[tokio::test(start_paused = true)]
async fn unblocked_deletion_gets_one_pass_without_retries() {
    let recorder = HandlerRecorder::new();
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_delete("cleanup", recorder.fail_with_backoff(5)))
        .build()
        .unwrap();
    let handle = ReactorBuilder::new(registry)
        .with_settings(fast_settings())
        .build()
        .start();

    handle.dispatch(RawEvent::deleted(widget("w1", json!({}))));
    assert!(wait_until(LIMIT, || recorder.calls("cleanup") == 1).await);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(recorder.calls("cleanup"), 1);

    handle.shutdown().await;
}
