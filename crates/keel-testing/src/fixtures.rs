//! Entity bodies, identities and settings for tests.

use std::time::Duration;

use keel_core::{Body, EntityIdentity, Settings};
use serde_json::{json, Value};
use uuid::Uuid;

pub const KIND: &str = "Widget";
pub const NAMESPACE: &str = "default";

pub fn identity(name: &str) -> EntityIdentity {
    EntityIdentity::new(KIND, NAMESPACE, name)
}

/// A `Widget` body with the given spec.
pub fn widget(name: &str, spec: Value) -> Body {
    json!({
        "apiVersion": "keel.dev/v1",
        "kind": KIND,
        "metadata": {
            "name": name,
            "namespace": NAMESPACE,
            "uid": Uuid::new_v4().to_string(),
            "resourceVersion": "1",
        },
        "spec": spec,
    })
}

/// Set `metadata.resourceVersion`.
pub fn with_version(mut body: Body, version: u64) -> Body {
    body["metadata"]["resourceVersion"] = json!(version.to_string());
    body
}

/// Mark the body as being deleted.
pub fn deleting(mut body: Body) -> Body {
    body["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
    body
}

/// Settings with short windows, for tests on a paused clock.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.batching.batch_window = Duration::from_millis(10);
    settings.batching.idle_timeout = Duration::from_secs(60);
    settings.batching.exit_timeout = Duration::from_secs(1);
    settings.persistence.consistency_timeout = Duration::from_secs(1);
    settings
}
