//! Per-handler progress and the record the progress store keeps.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cause::Reason;
use crate::handler::HandlerDescriptor;

/// Identifier of a registered handler; the key of its progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(String);

impl HandlerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Where a handler stands for the current cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerStatus {
    Pending,
    Success,
    /// Permanently failed.
    Failure,
    AwaitingRetry,
}

/// Progress of one handler for one entity.
///
/// Times are loop times of the reactor's [`crate::Clock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerState {
    pub status: HandlerStatus,
    pub attempts: u32,
    /// When the handler was first selected for this cause.
    pub started: f64,
    /// When the handler last ran.
    pub last_seen: Option<f64>,
    /// Not to be invoked before this time.
    pub delayed: Option<f64>,
    pub message: Option<String>,
    /// The cause reason this state belongs to.
    pub purpose: Option<Reason>,
}

impl HandlerState {
    pub fn pending(now: f64, purpose: Reason) -> Self {
        Self {
            status: HandlerStatus::Pending,
            attempts: 0,
            started: now,
            last_seen: None,
            delayed: None,
            message: None,
            purpose: Some(purpose),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, HandlerStatus::Success | HandlerStatus::Failure)
    }

    /// Unfinished and not deferred past `now`.
    pub fn is_awake(&self, now: f64) -> bool {
        !self.is_finished() && self.delayed.map_or(true, |t| t <= now)
    }

    /// Seconds since the handler was first selected.
    pub fn runtime(&self, now: f64) -> f64 {
        (now - self.started).max(0.0)
    }
}

/// States of all handlers of one entity for the current cause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerStates(BTreeMap<HandlerId, HandlerState>);

impl HandlerStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &HandlerId) -> Option<&HandlerState> {
        self.0.get(id)
    }

    pub fn insert(&mut self, id: HandlerId, state: HandlerState) {
        self.0.insert(id, state);
    }

    pub fn remove(&mut self, id: &HandlerId) -> Option<HandlerState> {
        self.0.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HandlerId, &HandlerState)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only states started for `purpose`; others belong to an older cause.
    pub fn for_purpose(&self, purpose: Reason) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(_, s)| s.purpose.map_or(true, |p| p == purpose))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Purpose of the unfinished states, if a cause is still being handled.
    pub fn pending_purpose(&self) -> Option<Reason> {
        self.0
            .values()
            .filter(|s| !s.is_finished())
            .find_map(|s| s.purpose)
    }

    /// Make sure every handler has a state, creating pending ones.
    pub fn ensure(&mut self, handlers: &[Arc<HandlerDescriptor>], now: f64, purpose: Reason) {
        for handler in handlers {
            self.0
                .entry(handler.id.clone())
                .or_insert_with(|| HandlerState::pending(now, purpose));
        }
    }

    pub fn is_finished(&self, id: &HandlerId) -> bool {
        self.0.get(id).is_some_and(HandlerState::is_finished)
    }

    /// Unknown handlers count as awake: they have never run.
    pub fn is_awake(&self, id: &HandlerId, now: f64) -> bool {
        self.0.get(id).map_or(true, |s| s.is_awake(now))
    }

    pub fn attempts(&self, id: &HandlerId) -> u32 {
        self.0.get(id).map_or(0, |s| s.attempts)
    }

    /// Whether all `handlers` reached success or permanent failure.
    pub fn all_finished(&self, handlers: &[Arc<HandlerDescriptor>]) -> bool {
        handlers.iter().all(|h| self.is_finished(&h.id))
    }

    /// Seconds until the earliest unfinished handler wakes up.
    ///
    /// `None` when everything is finished; zero when something is awake.
    pub fn delay(&self, handlers: &[Arc<HandlerDescriptor>], now: f64) -> Option<f64> {
        handlers
            .iter()
            .filter_map(|h| self.0.get(&h.id))
            .filter(|s| !s.is_finished())
            .map(|s| s.delayed.map_or(0.0, |t| (t - now).max(0.0)))
            .min_by(f64::total_cmp)
    }
}

impl FromIterator<(HandlerId, HandlerState)> for HandlerStates {
    fn from_iter<T: IntoIterator<Item = (HandlerId, HandlerState)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Everything the progress store keeps for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Essence of the last fully handled state.
    pub diffbase: Option<Value>,
    /// Handler states of the unresolved cause, if any.
    pub handlers: HandlerStates,
    /// Deletion handlers have all finished.
    #[serde(default)]
    pub deletion_handled: bool,
}
