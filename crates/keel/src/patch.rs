//! Outbound changes: merge patches and posted events.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SinkError;
use crate::resource::{Body, EntityIdentity};

/// A JSON merge patch (RFC 7386) accumulated during one cycle.
///
/// `null` leaves remove keys; lists are replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Map<String, Value>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Set a value at a path of keys, creating intermediate objects.
    pub fn set<S: AsRef<str>>(&mut self, path: &[S], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut node = &mut self.0;
        for key in parents {
            let slot = node
                .entry(key.as_ref().to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            node = match slot {
                Value::Object(map) => map,
                _ => return,
            };
        }
        node.insert(last.as_ref().to_owned(), value);
    }

    /// Value at a path, if this patch sets one.
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut node = self.0.get(first.as_ref())?;
        for key in rest {
            node = node.get(key.as_ref())?;
        }
        Some(node)
    }

    /// Set (or with `None`, remove) an annotation.
    pub fn set_annotation(&mut self, key: &str, value: Option<String>) {
        self.set(
            &["metadata", "annotations", key],
            value.map_or(Value::Null, Value::String),
        );
    }

    /// Set (or with `null`, remove) a field under `status`.
    pub fn set_status(&mut self, key: &str, value: Value) {
        self.set(&["status", key], value);
    }

    /// Replace the finalizer list.
    pub fn set_finalizers(&mut self, finalizers: Vec<String>) {
        self.set(
            &["metadata", "finalizers"],
            Value::Array(finalizers.into_iter().map(Value::String).collect()),
        );
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Apply this patch to `target` in place.
    pub fn apply_to(&self, target: &mut Value) {
        merge(target, &Value::Object(self.0.clone()));
    }
}

fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                merge(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Severity of a posted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Normal,
    Warning,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
            Self::Error => "Error",
        })
    }
}

/// A human-oriented record attached to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(kind: EventKind, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            message: message.into(),
            time: Utc::now(),
        }
    }
}

/// Where patches and events go.
#[async_trait]
pub trait PatchSink: Send + Sync {
    /// Apply a merge patch. Returns the patched body, if the backend has one.
    async fn patch(&self, identity: &EntityIdentity, patch: &Patch) -> Result<Option<Body>, SinkError>;

    /// Post an event about the entity. Best effort.
    async fn post_event(&self, identity: &EntityIdentity, event: EventRecord) -> Result<(), SinkError> {
        let _ = (identity, event);
        Ok(())
    }
}

/// Sink that drops everything; the default for a reactor without outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl PatchSink for NullSink {
    async fn patch(&self, _identity: &EntityIdentity, _patch: &Patch) -> Result<Option<Body>, SinkError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_nested_patch() {
        let mut patch = Patch::new();
        assert!(patch.is_empty());
        patch.set_annotation("keel.dev/a", Some("1".into()));
        patch.set_annotation("keel.dev/b", None);
        patch.set_status("create-fn", json!({"ok": true}));
        patch.set_finalizers(vec!["keel.dev/finalizer".into()]);
        assert_eq!(
            patch.as_value(),
            json!({
                "metadata": {
                    "annotations": {"keel.dev/a": "1", "keel.dev/b": null},
                    "finalizers": ["keel.dev/finalizer"],
                },
                "status": {"create-fn": {"ok": true}},
            })
        );
        assert_eq!(patch.get(&["status", "create-fn", "ok"]), Some(&json!(true)));
    }

    #[test]
    fn applies_as_merge_patch() {
        let mut body = json!({
            "metadata": {"annotations": {"keep": "x", "drop": "y"}, "finalizers": ["a", "b"]},
            "spec": {"size": 1},
        });
        let mut patch = Patch::new();
        patch.set_annotation("drop", None);
        patch.set_finalizers(vec![]);
        patch.set(&["spec", "size"], json!(2));
        patch.apply_to(&mut body);
        assert_eq!(
            body,
            json!({
                "metadata": {"annotations": {"keep": "x"}, "finalizers": []},
                "spec": {"size": 2},
            })
        );
    }

    #[test]
    fn scalar_replaced_by_object() {
        let mut patch = Patch::new();
        patch.set(&["status"], json!("scalar"));
        patch.set(&["status", "inner"], json!(1));
        assert_eq!(patch.as_value(), json!({"status": {"inner": 1}}));
    }
}
