//! Progress kept on the entity survives a reactor restart.

use std::sync::Arc;
use std::time::Duration;

use keel_core::{
    Clock, HandlerDescriptor, RawEvent, ReactorBuilder, ReactorHandle, Reason, Registry,
};
use keel_outbox::Outbox;
use keel_persistence::AnnotationsProgressStore;
use keel_testing::fixtures::{fast_settings, identity, widget};
use keel_testing::{wait_until, HandlerRecorder};
use serde_json::json;

const LIMIT: Duration = Duration::from_secs(5);

fn registry(recorder: &HandlerRecorder) -> Registry {
    Registry::builder()
        .with_handler(HandlerDescriptor::on_create("first", recorder.succeed()))
        .with_handler(HandlerDescriptor::on_create(
            "second",
            recorder.fail_temporarily(1, Duration::from_secs(30)),
        ))
        .build()
        .unwrap()
}

fn reactor(registry: Registry, outbox: &Arc<Outbox>) -> ReactorHandle {
    let clock = Clock::new();
    ReactorBuilder::new(registry)
        .with_settings(fast_settings())
        .with_clock(clock)
        .with_store(AnnotationsProgressStore::new(clock, "keel.dev"))
        .with_shared_sink(outbox.clone())
        .build()
        .start()
}

/// Run until "first" is done and "second" waits for its retry, then stop.
async fn interrupted_creation(outbox: &Arc<Outbox>) {
    let id = identity("w1");
    let before = HandlerRecorder::new();
    let handle = reactor(registry(&before), outbox);
    let forwarder = outbox.forward_to(handle.clone());

    outbox.create(widget("w1", json!({"size": 1}))).unwrap();
    assert!(wait_until(LIMIT, || before.total_calls() == 2).await);
    assert!(
        wait_until(LIMIT, || {
            outbox
                .get(&id)
                .is_some_and(|body| body.pointer("/metadata/annotations/keel.dev~1second").is_some())
        })
        .await
    );

    handle.shutdown().await;
    forwarder.abort();
}

/// The creation finished after the restart: handled state replaces progress.
async fn creation_settles(outbox: &Outbox) -> bool {
    let id = identity("w1");
    wait_until(LIMIT, || {
        outbox.get(&id).is_some_and(|body| {
            body.pointer("/metadata/annotations/keel.dev~1last-handled-configuration")
                .is_some()
                && body.pointer("/metadata/annotations/keel.dev~1second").is_none()
        })
    })
    .await
}

// ============================================================================
// Restarts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn pending_work_resumes_after_a_restart() {
    let outbox = Arc::new(Outbox::new());
    let id = identity("w1");
    interrupted_creation(&outbox).await;

    // A new process sees the current state again; "first" is done, and
    // "second" still waits out its delay.
    let after = HandlerRecorder::new();
    let handle = reactor(registry(&after), &outbox);
    handle.dispatch(RawEvent::modified(outbox.get(&id).unwrap()));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(after.total_calls(), 0);

    assert!(wait_until(Duration::from_secs(30), || after.calls("second") == 1).await);
    assert_eq!(after.calls("first"), 0);
    let retry = after.last("second").unwrap();
    assert_eq!(retry.retry, 1);
    assert_eq!(retry.reason, Reason::Create);

    assert!(creation_settles(&outbox).await);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn listing_after_a_restart_continues_the_creation() {
    let outbox = Arc::new(Outbox::new());
    let id = identity("w1");
    interrupted_creation(&outbox).await;

    let after = HandlerRecorder::new();
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_create("first", after.succeed()))
        .with_handler(HandlerDescriptor::on_create("second", after.succeed()))
        .with_handler(HandlerDescriptor::on_resume("resume", after.succeed()))
        .build()
        .unwrap();
    let handle = reactor(registry, &outbox);
    handle.dispatch(RawEvent::listed(outbox.get(&id).unwrap()));

    assert!(wait_until(Duration::from_secs(60), || after.calls("second") == 1).await);
    let retry = after.last("second").unwrap();
    assert_eq!(retry.reason, Reason::Create);
    assert_eq!(retry.retry, 1);
    assert_eq!(after.calls("first"), 0);
    assert_eq!(after.calls("resume"), 0);

    assert!(creation_settles(&outbox).await);
    handle.shutdown().await;
}

// ============================================================================
// Stored progress
// ============================================================================

#[tokio::test(start_paused = true)]
async fn slashed_handler_ids_keep_their_progress() {
    let outbox = Arc::new(Outbox::new());
    let id = identity("w1");
    let recorder = HandlerRecorder::new();
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_create("grp/done", recorder.succeed()))
        .with_handler(HandlerDescriptor::on_create(
            "grp/later",
            recorder.fail_temporarily(2, Duration::from_secs(1)),
        ))
        .build()
        .unwrap();
    let handle = reactor(registry, &outbox);
    let forwarder = outbox.forward_to(handle.clone());

    outbox.create(widget("w1", json!({"size": 1}))).unwrap();
    assert!(wait_until(LIMIT, || recorder.calls("grp/later") == 3).await);
    assert!(creation_settles(&outbox).await);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(recorder.calls("grp/done"), 1);
    assert_eq!(recorder.calls("grp/later"), 3);
    assert_eq!(recorder.last("grp/later").unwrap().retry, 2);
    let annotations = outbox.get(&id).unwrap()["metadata"]["annotations"].clone();
    assert!(annotations.get("keel.dev/grp.done").is_none());

    handle.shutdown().await;
    forwarder.abort();
}
