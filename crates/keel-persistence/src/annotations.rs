use async_trait::async_trait;
use keel_core::{
    Body, Clock, Commit, EntityIdentity, HandlerStates, Patch, ProgressRecord, ProgressStore,
    StoreError,
};
use serde_json::Value;
use smallvec::SmallVec;
use tracing::trace;

use crate::codec::{sanitize, PersistedState};

/// Annotation holding the essence of the last fully handled state.
pub const LAST_HANDLED_CONFIGURATION: &str = "last-handled-configuration";
/// Annotation marking that deletion handlers have finished.
pub const DELETION_HANDLED: &str = "deletion-handled";

const RESERVED: [&str; 2] = [LAST_HANDLED_CONFIGURATION, DELETION_HANDLED];

/// Keeps progress in annotations: `<prefix>/<handler-id>` per handler, each a
/// JSON-encoded state, plus `<prefix>/last-handled-configuration`.
#[derive(Debug, Clone)]
pub struct AnnotationsProgressStore {
    clock: Clock,
    prefix: String,
}

impl AnnotationsProgressStore {
    pub fn new(clock: Clock, prefix: impl Into<String>) -> Self {
        Self {
            clock,
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, sanitize(name))
    }

    /// Our annotations on the body, with the prefix stripped.
    fn own<'a>(&'a self, body: &'a Body) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
        let prefix = format!("{}/", self.prefix);
        body.pointer("/metadata/annotations")
            .and_then(Value::as_object)
            .into_iter()
            .flatten()
            .filter_map(move |(key, value)| key.strip_prefix(prefix.as_str()).map(|name| (name, value)))
    }

    pub(crate) fn load_states(&self, body: &Body) -> Result<HandlerStates, StoreError> {
        let now = self.clock.now();
        let mut states = HandlerStates::new();
        for (name, value) in self.own(body) {
            if RESERVED.contains(&name) {
                continue;
            }
            let Some(persisted) = PersistedState::own(value) else {
                continue;
            };
            states.insert(persisted.handler_id(name), persisted.decode(&self.clock, now)?);
        }
        Ok(states)
    }

    pub(crate) fn load_diffbase(&self, identity: &EntityIdentity, body: &Body) -> Result<Option<Value>, StoreError> {
        let raw = self
            .own(body)
            .find(|(name, _)| *name == LAST_HANDLED_CONFIGURATION)
            .and_then(|(_, value)| value.as_str());
        raw.map(|raw| {
            serde_json::from_str(raw).map_err(|err| StoreError::Corrupted {
                entity: identity.to_string(),
                reason: format!("{LAST_HANDLED_CONFIGURATION}: {err}"),
            })
        })
        .transpose()
    }

    fn write(&self, body: &Body, record: Option<&ProgressRecord>, patch: &mut Patch) -> Result<(), StoreError> {
        let current: Vec<(String, Value)> = self
            .own(body)
            .map(|(name, value)| (name.to_owned(), value.clone()))
            .collect();
        let current_value = |name: &str| current.iter().find(|(n, _)| n == name).map(|(_, v)| v);

        let mut wanted: SmallVec<[(String, String); 8]> = SmallVec::new();
        if let Some(record) = record {
            for (id, state) in record.handlers.iter() {
                let encoded = serde_json::to_string(&PersistedState::encode(id, state, &self.clock)?)?;
                wanted.push((sanitize(id.as_str()), encoded));
            }
            if let Some(diffbase) = &record.diffbase {
                wanted.push((LAST_HANDLED_CONFIGURATION.to_owned(), serde_json::to_string(diffbase)?));
            }
            if record.deletion_handled {
                wanted.push((DELETION_HANDLED.to_owned(), "true".to_owned()));
            }
        }

        for (name, value) in &wanted {
            if current_value(name).and_then(Value::as_str) != Some(value.as_str()) {
                patch.set_annotation(&self.key(name), Some(value.clone()));
            }
        }
        for (name, value) in &current {
            if wanted.iter().any(|(n, _)| n == name) {
                continue;
            }
            let ours = RESERVED.contains(&name.as_str()) || PersistedState::is_own(value);
            let keeps_diffbase = record.is_some() && name == LAST_HANDLED_CONFIGURATION;
            if ours && !keeps_diffbase {
                patch.set_annotation(&self.key(name), None);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for AnnotationsProgressStore {
    async fn load(&self, identity: &EntityIdentity, body: &Body) -> Result<ProgressRecord, StoreError> {
        Ok(ProgressRecord {
            diffbase: self.load_diffbase(identity, body)?,
            handlers: self.load_states(body)?,
            deletion_handled: self
                .own(body)
                .any(|(name, value)| name == DELETION_HANDLED && value.as_str() == Some("true")),
        })
    }

    async fn commit(
        &self,
        identity: &EntityIdentity,
        body: &Body,
        commit: Commit,
        patch: &mut Patch,
    ) -> Result<(), StoreError> {
        match commit {
            Commit::Record(record) => {
                trace!(%identity, handlers = record.handlers.len(), "writing progress annotations");
                self.write(body, Some(&record), patch)
            }
            Commit::Purge => {
                trace!(%identity, "purging progress annotations");
                self.write(body, None, patch)
            }
        }
    }
}
