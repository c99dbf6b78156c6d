//! # Minimal Example
//!
//! One creation handler and one update handler, fed by an in-memory outbox.
//!
//! ```text
//! RUST_LOG=info,keel_core=debug cargo run -p minimal-demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use keel_core::{handler_fn, EntityIdentity, HandlerDescriptor, ReactorBuilder, Registry};
use keel_outbox::Outbox;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Handlers
// ============================================================================

fn registry() -> Result<Registry> {
    let registry = Registry::builder()
        .with_handler(HandlerDescriptor::on_create(
            "greet",
            handler_fn(|ctx| async move {
                info!(name = %ctx.identity().name, spec = %ctx.spec(), "widget created");
                Ok(Some(json!({"message": "hello"})))
            }),
        ))
        .with_handler(HandlerDescriptor::on_update(
            "resize",
            handler_fn(|ctx| async move {
                for item in ctx.diff().iter() {
                    info!(op = ?item.op, path = %item.path, old = ?item.old, new = ?item.new, "widget changed");
                }
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

    let outbox = Arc::new(Outbox::new());
    let handle = ReactorBuilder::new(registry()?)
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

    outbox.update(&id, |body| body["spec"]["size"] = json!(3))?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    if let Some(body) = outbox.get(&id) {
        info!(status = %body["status"], "final status");
    }

    handle.shutdown().await;
    forwarder.abort();
    Ok(())
}
