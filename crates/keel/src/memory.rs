//! In-memory state that lives as long as the process or the lane.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::resource::{Body, EventType};

/// A free-form bag of values shared with handlers.
///
/// Cloning shares the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct Memo(Arc<DashMap<String, Value>>);

impl Memo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.get(key).map(|v| v.value().clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.remove(key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a lane's worker remembers about its entity between cycles.
///
/// Owned by the worker; dropped when the lane is torn down.
#[derive(Debug, Clone, Default)]
pub struct EntityMemory {
    /// Loop time the lane was created.
    pub created: f64,
    /// Loop time of the last notification.
    pub last_seen: f64,
    pub idle: bool,
    /// Copy of the diffbase as last committed by this worker.
    pub diffbase: Option<Value>,
    /// Newest known body: the last notification, or the sink's patched body.
    pub latest_body: Option<Body>,
    pub last_event_type: Option<EventType>,
    pub memo: Memo,
}

impl EntityMemory {
    pub fn new(now: f64) -> Self {
        Self {
            created: now,
            last_seen: now,
            ..Self::default()
        }
    }
}
