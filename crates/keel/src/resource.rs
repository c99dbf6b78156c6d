//! Entities, raw notifications and the identity extractor.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Observed state of an entity, as delivered by the transport.
pub type Body = Value;

/// Stable identity of one cluster-managed object.
///
/// Equality and hashing use `kind`, `namespace` and `name`; the `uid` is
/// informational, so an object re-created under the same name keeps its lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityIdentity {
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,
}

impl EntityIdentity {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: Uuid) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Derive the identity from an object body.
    ///
    /// Returns `None` when `kind` or `metadata.name` is missing.
    pub fn from_body(body: &Body) -> Option<Self> {
        let kind = body.get("kind")?.as_str()?;
        let metadata = body.get("metadata")?;
        let name = metadata.get("name")?.as_str()?;
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let uid = metadata
            .get("uid")
            .and_then(Value::as_str)
            .and_then(|uid| Uuid::parse_str(uid).ok());
        Some(Self {
            kind: kind.to_owned(),
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            uid,
        })
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl PartialEq for EntityIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.namespace == other.namespace && self.name == other.name
    }
}

impl Eq for EntityIdentity {}

impl Hash for EntityIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.namespace.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for EntityIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Type of a raw notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "ADDED", alias = "added")]
    Added,
    #[serde(rename = "MODIFIED", alias = "modified")]
    Modified,
    #[serde(rename = "DELETED", alias = "deleted")]
    Deleted,
    #[serde(rename = "BOOKMARK", alias = "bookmark")]
    Bookmark,
    /// Any other type string; handled like a modification.
    #[serde(other)]
    Unknown,
}

/// A raw change notification.
///
/// `event_type: None` marks a synthetic notification (initial listing), which
/// the cause detector turns into a resumption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type", default)]
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub object: Body,
}

impl RawEvent {
    pub fn new(event_type: Option<EventType>, object: Body) -> Self {
        Self { event_type, object }
    }

    pub fn added(object: Body) -> Self {
        Self::new(Some(EventType::Added), object)
    }

    pub fn modified(object: Body) -> Self {
        Self::new(Some(EventType::Modified), object)
    }

    pub fn deleted(object: Body) -> Self {
        Self::new(Some(EventType::Deleted), object)
    }

    /// A synthetic notification for an entity that already exists.
    pub fn listed(object: Body) -> Self {
        Self::new(None, object)
    }

    pub fn is_deleted(&self) -> bool {
        self.event_type == Some(EventType::Deleted)
    }
}

/// One unit in a lane's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(RawEvent),
    /// No further notifications will arrive for this lane.
    EndOfStream,
}

impl From<RawEvent> for StreamItem {
    fn from(event: RawEvent) -> Self {
        Self::Event(event)
    }
}

/// The version token of the object embedded in a notification.
///
/// `None` for the end-of-stream marker, and for notifications without an
/// object, metadata or a string `resourceVersion`.
pub fn get_version(item: &StreamItem) -> Option<String> {
    match item {
        StreamItem::EndOfStream => None,
        StreamItem::Event(event) => resource_version(&event.object).map(str::to_owned),
    }
}

/// `metadata.resourceVersion` of a body, if it is a string.
pub fn resource_version(body: &Body) -> Option<&str> {
    body.get("metadata")?.get("resourceVersion")?.as_str()
}

/// Labels of a body; empty when absent.
pub fn labels(body: &Body) -> impl Iterator<Item = (&str, &str)> {
    body.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
        .filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v)))
}

/// Whether the object is marked for deletion and waits for finalizers.
pub fn is_deletion_ongoing(body: &Body) -> bool {
    body.get("metadata")
        .and_then(|m| m.get("deletionTimestamp"))
        .is_some_and(|ts| !ts.is_null())
}

/// Whether `finalizer` is present in `metadata.finalizers`.
pub fn has_finalizer(body: &Body, finalizer: &str) -> bool {
    finalizers(body).any(|f| f == finalizer)
}

pub fn finalizers(body: &Body) -> impl Iterator<Item = &str> {
    body.get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn item(value: Value) -> StreamItem {
        StreamItem::Event(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn version_of_end_of_stream_is_none() {
        assert_eq!(get_version(&StreamItem::EndOfStream), None);
    }

    #[test]
    fn version_of_partial_events_is_none() {
        assert_eq!(get_version(&item(json!({}))), None);
        assert_eq!(get_version(&item(json!({"object": {}}))), None);
        assert_eq!(get_version(&item(json!({"object": {"metadata": {}}}))), None);
        assert_eq!(
            get_version(&item(json!({"object": {"metadata": {"resourceVersion": 7}}}))),
            None
        );
    }

    #[test]
    fn version_is_returned_verbatim() {
        let event = item(json!({"object": {"metadata": {"resourceVersion": "123abc"}}}));
        assert_eq!(get_version(&event).as_deref(), Some("123abc"));
    }

    #[test]
    fn event_types_deserialize_leniently() {
        let added: RawEvent = serde_json::from_value(json!({"type": "ADDED"})).unwrap();
        let deleted: RawEvent = serde_json::from_value(json!({"type": "deleted"})).unwrap();
        let odd: RawEvent = serde_json::from_value(json!({"type": "irrelevant"})).unwrap();
        let none: RawEvent = serde_json::from_value(json!({"type": null})).unwrap();
        assert_eq!(added.event_type, Some(EventType::Added));
        assert_eq!(deleted.event_type, Some(EventType::Deleted));
        assert_eq!(odd.event_type, Some(EventType::Unknown));
        assert_eq!(none.event_type, None);
    }

    #[test]
    fn identity_ignores_uid_for_equality() {
        let a = EntityIdentity::new("Widget", "ns", "w1").with_uid(Uuid::new_v4());
        let b = EntityIdentity::new("Widget", "ns", "w1");
        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn identity_from_body() {
        let body = json!({
            "kind": "Widget",
            "metadata": {"name": "w1", "namespace": "prod", "uid": "7f1b6a52-2f1d-4a0e-9a41-0e9f1f1f6c11"},
        });
        let identity = EntityIdentity::from_body(&body).unwrap();
        assert_eq!(identity.to_string(), "Widget/prod/w1");
        assert!(identity.uid.is_some());
        assert!(EntityIdentity::from_body(&json!({"kind": "Widget"})).is_none());
    }

    #[test]
    fn deletion_and_finalizer_helpers() {
        let body = json!({"metadata": {"deletionTimestamp": "2020-01-01T00:00:00Z", "finalizers": ["a/b"]}});
        assert!(is_deletion_ongoing(&body));
        assert!(has_finalizer(&body, "a/b"));
        assert!(!has_finalizer(&body, "c/d"));
        assert!(!is_deletion_ongoing(&json!({"metadata": {}})));
    }
}
