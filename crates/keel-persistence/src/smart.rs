use async_trait::async_trait;
use keel_core::{Body, Clock, Commit, EntityIdentity, Patch, ProgressRecord, ProgressStore, StoreError};

use crate::annotations::AnnotationsProgressStore;
use crate::status::StatusProgressStore;

/// Writes progress to both annotations and status; reads from both, with
/// annotations taking precedence.
///
/// Useful while migrating entities from one layout to the other.
#[derive(Debug, Clone)]
pub struct SmartProgressStore {
    annotations: AnnotationsProgressStore,
    status: StatusProgressStore,
}

impl SmartProgressStore {
    pub fn new(clock: Clock, prefix: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            annotations: AnnotationsProgressStore::new(clock, prefix),
            status: StatusProgressStore::new(clock, field),
        }
    }
}

#[async_trait]
impl ProgressStore for SmartProgressStore {
    async fn load(&self, identity: &EntityIdentity, body: &Body) -> Result<ProgressRecord, StoreError> {
        let primary = self.annotations.load(identity, body).await?;
        let fallback = self.status.load(identity, body).await?;

        let mut handlers = fallback.handlers;
        for (id, state) in primary.handlers.iter() {
            handlers.insert(id.clone(), state.clone());
        }
        Ok(ProgressRecord {
            diffbase: primary.diffbase.or(fallback.diffbase),
            handlers,
            deletion_handled: primary.deletion_handled || fallback.deletion_handled,
        })
    }

    async fn commit(
        &self,
        identity: &EntityIdentity,
        body: &Body,
        commit: Commit,
        patch: &mut Patch,
    ) -> Result<(), StoreError> {
        self.annotations.commit(identity, body, commit.clone(), patch).await?;
        self.status.commit(identity, body, commit, patch).await
    }
}
