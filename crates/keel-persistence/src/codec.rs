//! The persisted shape of a handler state.
//!
//! Times are stored as timestamps (see [`keel_core::format_iso8601`]) so a
//! restarted process, with a new clock anchor, can still tell how long ago a
//! handler started and when it may run again.

use keel_core::{Clock, HandlerId, HandlerState, HandlerStatus, Reason, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One handler's progress as stored on the entity.
///
/// Unknown fields are ignored and missing ones default, so older and newer
/// writers can share an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedState {
    /// The handler id as registered; keys only hold a sanitized form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delayed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<Reason>,
    pub retries: u32,
    pub success: bool,
    pub failure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PersistedState {
    pub fn encode(id: &HandlerId, state: &HandlerState, clock: &Clock) -> Result<Self, StoreError> {
        Ok(Self {
            id: Some(id.as_str().to_owned()),
            started: clock.format(Some(state.started))?,
            last_seen: clock.format(state.last_seen)?,
            delayed: clock.format(state.delayed)?,
            purpose: state.purpose,
            retries: state.attempts,
            success: state.status == HandlerStatus::Success,
            failure: state.status == HandlerStatus::Failure,
            message: state.message.clone(),
        })
    }

    /// Decode into a live state; `now` stands in for a missing start time.
    pub fn decode(&self, clock: &Clock, now: f64) -> Result<HandlerState, StoreError> {
        let status = if self.success {
            HandlerStatus::Success
        } else if self.failure {
            HandlerStatus::Failure
        } else if self.retries > 0 {
            HandlerStatus::AwaitingRetry
        } else {
            HandlerStatus::Pending
        };
        Ok(HandlerState {
            status,
            attempts: self.retries,
            started: clock.parse(self.started.as_deref())?.unwrap_or(now),
            last_seen: clock.parse(self.last_seen.as_deref())?,
            delayed: clock.parse(self.delayed.as_deref())?,
            message: self.message.clone(),
            purpose: self.purpose,
        })
    }

    /// The id this state belongs to; `key` is where it was found.
    pub fn handler_id(&self, key: &str) -> HandlerId {
        HandlerId::new(self.id.as_deref().unwrap_or(key))
    }

    /// A state this crate wrote: every encoded state carries its start time.
    pub fn own(value: &Value) -> Option<Self> {
        Self::from_value(value).filter(|state| state.started.is_some())
    }

    pub fn is_own(value: &Value) -> bool {
        Self::own(value).is_some()
    }

    /// Parse a stored value; `None` if it is not a handler state at all.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(raw) => serde_json::from_str(raw).ok(),
            Value::Object(_) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }
}

/// The merge patch that turns `old` into `new`.
///
/// Merge patches keep keys they do not mention, so keys of `old` missing
/// from `new` are nulled out, recursively.
pub(crate) fn replacement(old: Option<&Value>, new: &Value) -> Value {
    match (old, new) {
        (Some(Value::Object(old)), Value::Object(new)) => {
            let mut patch: Map<String, Value> = new
                .iter()
                .map(|(key, value)| (key.clone(), replacement(old.get(key), value)))
                .collect();
            for key in old.keys().filter(|key| !new.contains_key(*key)) {
                patch.insert(key.clone(), Value::Null);
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Handler ids may contain characters not allowed in keys.
pub(crate) fn sanitize(id: &str) -> String {
    id.replace('/', ".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::BaseTime;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn state_survives_a_restart() {
        let base = BaseTime::now();
        let before = Clock::with_base(base);
        let mut state = HandlerState::pending(0.0, Reason::Update);
        state.status = HandlerStatus::AwaitingRetry;
        state.attempts = 2;
        state.last_seen = Some(1.5);
        state.delayed = Some(31.5);
        state.message = Some("not yet".into());
        let persisted = PersistedState::encode(&HandlerId::new("grp/slow"), &state, &before).unwrap();
        assert_eq!(persisted.handler_id("grp.slow"), HandlerId::new("grp/slow"));

        // Same wall-clock anchor, so offsets decode unchanged.
        let after = Clock::with_base(base);
        let decoded = persisted.decode(&after, 0.0).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn tolerates_foreign_and_partial_values() {
        assert_eq!(PersistedState::from_value(&json!("not json")), None);
        assert_eq!(PersistedState::from_value(&json!(42)), None);

        let partial = PersistedState::from_value(&json!("{\"success\": true, \"extra\": 1}")).unwrap();
        assert!(partial.success);
        assert_eq!(partial.retries, 0);
        assert_eq!(partial.handler_id("legacy"), HandlerId::new("legacy"));
    }

    #[test]
    fn only_states_with_a_start_time_are_own() {
        assert!(PersistedState::is_own(&json!({"started": "2020-12-31T23:59:59.123456", "retries": 1})));
        assert!(!PersistedState::is_own(&json!({"phase": "Ready"})));
        assert!(!PersistedState::is_own(&json!("{\"owner\": \"someone else\"}")));
        assert!(!PersistedState::is_own(&json!(true)));
    }

    #[test]
    fn replacement_nulls_dropped_keys() {
        let old = json!({"spec": {"a": 1, "b": 2}, "kind": "W"});
        let new = json!({"spec": {"a": 3}, "kind": "W"});
        assert_eq!(
            replacement(Some(&old), &new),
            json!({"spec": {"a": 3, "b": null}, "kind": "W"})
        );
        assert_eq!(replacement(None, &new), new);
    }

    #[test]
    fn ids_are_sanitized() {
        assert_eq!(sanitize("group/handler"), "group.handler");
    }
}
