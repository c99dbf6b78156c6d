//! Durable record of handler progress and the last handled state.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use crate::error::StoreError;
use crate::patch::Patch;
use crate::resource::{Body, EntityIdentity};
use crate::state::ProgressRecord;

/// What a cycle writes to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    /// Replace the stored record.
    Record(ProgressRecord),
    /// The entity is gone; remove everything.
    Purge,
}

/// Storage for [`ProgressRecord`]s.
///
/// Stores that keep progress on the entity itself read it from `body` and
/// write it by adding to `patch`; the cycle sends the patch afterwards.
/// Commits are all-or-nothing: one call per cycle.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn load(&self, identity: &EntityIdentity, body: &Body) -> Result<ProgressRecord, StoreError>;

    async fn commit(
        &self,
        identity: &EntityIdentity,
        body: &Body,
        commit: Commit,
        patch: &mut Patch,
    ) -> Result<(), StoreError>;
}

/// Process-local store, keyed by identity.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    records: DashMap<EntityIdentity, ProgressRecord>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &EntityIdentity) -> Option<ProgressRecord> {
        self.records.get(identity).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn load(&self, identity: &EntityIdentity, _body: &Body) -> Result<ProgressRecord, StoreError> {
        Ok(self.get(identity).unwrap_or_default())
    }

    async fn commit(
        &self,
        identity: &EntityIdentity,
        _body: &Body,
        commit: Commit,
        _patch: &mut Patch,
    ) -> Result<(), StoreError> {
        match commit {
            Commit::Record(record) => {
                trace!(%identity, handlers = record.handlers.len(), "progress recorded");
                self.records.insert(identity.clone(), record);
            }
            Commit::Purge => {
                trace!(%identity, "progress purged");
                self.records.remove(identity);
            }
        }
        Ok(())
    }
}
