use async_trait::async_trait;
use keel_core::{
    Body, Clock, Commit, EntityIdentity, HandlerStates, Patch, ProgressRecord, ProgressStore,
    StoreError,
};
use serde_json::{Map, Value};
use tracing::trace;

use crate::annotations::{DELETION_HANDLED, LAST_HANDLED_CONFIGURATION};
use crate::codec::{replacement, sanitize, PersistedState};

/// Keeps progress under `status.<field>`: one object per handler, the
/// last handled essence and the deletion marker next to them.
#[derive(Debug, Clone)]
pub struct StatusProgressStore {
    clock: Clock,
    field: String,
}

impl StatusProgressStore {
    pub fn new(clock: Clock, field: impl Into<String>) -> Self {
        Self {
            clock,
            field: field.into(),
        }
    }

    fn own<'a>(&self, body: &'a Body) -> Option<&'a Map<String, Value>> {
        body.get("status")?.get(&self.field)?.as_object()
    }

    pub(crate) fn load_states(&self, body: &Body) -> Result<HandlerStates, StoreError> {
        let now = self.clock.now();
        let mut states = HandlerStates::new();
        for (name, value) in self.own(body).into_iter().flatten() {
            if name == LAST_HANDLED_CONFIGURATION || name == DELETION_HANDLED {
                continue;
            }
            if let Some(persisted) = PersistedState::own(value) {
                states.insert(persisted.handler_id(name), persisted.decode(&self.clock, now)?);
            }
        }
        Ok(states)
    }

    pub(crate) fn load_diffbase(&self, body: &Body) -> Option<Value> {
        self.own(body)?
            .get(LAST_HANDLED_CONFIGURATION)
            .filter(|v| !v.is_null())
            .cloned()
    }
}

#[async_trait]
impl ProgressStore for StatusProgressStore {
    async fn load(&self, _identity: &EntityIdentity, body: &Body) -> Result<ProgressRecord, StoreError> {
        Ok(ProgressRecord {
            diffbase: self.load_diffbase(body),
            handlers: self.load_states(body)?,
            deletion_handled: self
                .own(body)
                .and_then(|own| own.get(DELETION_HANDLED))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    async fn commit(
        &self,
        identity: &EntityIdentity,
        body: &Body,
        commit: Commit,
        patch: &mut Patch,
    ) -> Result<(), StoreError> {
        let current = self.own(body).cloned().unwrap_or_default();
        let mut wanted = Map::new();
        if let Commit::Record(record) = &commit {
            for (id, state) in record.handlers.iter() {
                let persisted = PersistedState::encode(id, state, &self.clock)?;
                wanted.insert(sanitize(id.as_str()), serde_json::to_value(persisted)?);
            }
            if let Some(diffbase) = &record.diffbase {
                wanted.insert(LAST_HANDLED_CONFIGURATION.to_owned(), diffbase.clone());
            }
            if record.deletion_handled {
                wanted.insert(DELETION_HANDLED.to_owned(), Value::Bool(true));
            }
        }

        let mut changed = false;
        let mut update = Map::new();
        for (name, value) in &wanted {
            if current.get(name) != Some(value) {
                update.insert(name.clone(), replacement(current.get(name), value));
                changed = true;
            }
        }
        for (name, value) in &current {
            if wanted.contains_key(name) {
                continue;
            }
            let ours = name == LAST_HANDLED_CONFIGURATION
                || name == DELETION_HANDLED
                || PersistedState::is_own(value);
            if ours {
                update.insert(name.clone(), Value::Null);
                changed = true;
            }
        }
        if changed {
            trace!(%identity, field = %self.field, "writing progress status");
            patch.set(&["status", self.field.as_str()], Value::Object(update));
        }
        Ok(())
    }
}
