//! Indexers: in-memory lookups over every entity the reactor has seen.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

use crate::resource::{Body, EntityIdentity, RawEvent};

type IndexFn = Arc<dyn Fn(&EntityIdentity, &Body) -> Option<Value> + Send + Sync>;

/// Named indices, each mapping an entity to the value its function returned.
///
/// Updated by workers on every notification; read by handlers.
#[derive(Default)]
pub struct Indexers {
    functions: Vec<(String, IndexFn)>,
    indices: DashMap<String, DashMap<EntityIdentity, Value>>,
}

impl Indexers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an index. Entities for which `f` returns `None` are not indexed.
    pub fn with_index(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&EntityIdentity, &Body) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        self.indices.insert(name.clone(), DashMap::new());
        self.functions.push((name, Arc::new(f)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Update all indices from a raw notification.
    pub fn index(&self, identity: &EntityIdentity, raw_event: &RawEvent) {
        if raw_event.is_deleted() || !raw_event.object.is_object() {
            self.forget(identity);
            return;
        }
        for (name, f) in &self.functions {
            let Some(index) = self.indices.get(name) else {
                continue;
            };
            match f(identity, &raw_event.object) {
                Some(value) => {
                    trace!(index = %name, %identity, "indexed");
                    index.insert(identity.clone(), value);
                }
                None => {
                    index.remove(identity);
                }
            }
        }
    }

    /// Remove the entity from every index.
    pub fn forget(&self, identity: &EntityIdentity) {
        for index in self.indices.iter() {
            index.remove(identity);
        }
    }

    /// Indexed value of one entity.
    pub fn get(&self, name: &str, identity: &EntityIdentity) -> Option<Value> {
        self.indices
            .get(name)?
            .get(identity)
            .map(|v| v.value().clone())
    }

    /// Snapshot of a whole index.
    pub fn lookup(&self, name: &str) -> Vec<(EntityIdentity, Value)> {
        self.indices
            .get(name)
            .map(|index| {
                index
                    .iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Debug for Indexers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Indexers")
            .field("indices", &self.functions.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}
