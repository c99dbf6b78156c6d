//! # Deletion Retry Example
//!
//! A deletion handler that is not ready for its first three attempts. The
//! finalizer keeps the object around until the handler succeeds; progress is
//! kept in annotations, so it would survive a restart in between.
//!
//! ```text
//! RUST_LOG=info,keel_core=debug cargo run -p deletion-retry-demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use keel_core::{
    handler_fn, Clock, EntityIdentity, HandlerDescriptor, HandlerError, ReactorBuilder, Registry,
    Settings,
};
use keel_outbox::Outbox;
use keel_persistence::AnnotationsProgressStore;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ATTEMPTS_BEFORE_SUCCESS: u32 = 3;

// ============================================================================
// Handlers
// ============================================================================

fn registry() -> Result<Registry> {
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_create(
            "create",
            handler_fn(|ctx| async move {
                info!(name = %ctx.identity().name, "widget created");
                Ok(None)
            }),
        ))
        .with_handler(HandlerDescriptor::on_delete(
            "release",
            handler_fn(|ctx| async move {
                if ctx.retry < ATTEMPTS_BEFORE_SUCCESS {
                    warn!(retry = ctx.retry, "external resources still attached");
                    return Err(HandlerError::temporary(
                        "external resources still attached",
                        Duration::from_secs(5),
                    ));
                }
                info!(retry = ctx.retry, runtime = ?ctx.runtime, "external resources released");
                Ok(None)
            }),
        ))
        .build()?;
    Ok(registry)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::default();
    let clock = Clock::new();
    let outbox = Arc::new(Outbox::new());
    let handle = ReactorBuilder::new(registry()?)
        .with_store(AnnotationsProgressStore::new(
            clock,
            settings.persistence.annotation_prefix.clone(),
        ))
        .with_settings(settings)
        .with_clock(clock)
        .with_shared_sink(outbox.clone())
        .build()
        .start();
    let forwarder = outbox.forward_to(handle.clone());

    let id = EntityIdentity::new("Widget", "default", "demo");
    outbox.create(json!({
        "apiVersion": "keel.dev/v1",
        "kind": "Widget",
        "metadata": {"name": "demo", "namespace": "default"},
        "spec": {"size": 1},
    }))?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    info!("deleting the widget");
    outbox.delete(&id)?;
    while outbox.contains(&id) {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    info!(events = outbox.events().len(), "widget is gone");

    handle.shutdown().await;
    forwarder.abort();
    Ok(())
}
