//! Cause detection: why is this processing cycle running?

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diff::{diff, essence, Diff, FieldPath};
use crate::resource::{is_deletion_ongoing, Body, EntityIdentity, EventType, RawEvent};

/// Reason of a cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reason {
    Create,
    Update,
    Delete,
    Resume,
    /// A raw notification, for event-watching handlers.
    Event,
    Noop,
    /// The entity is fully removed; nothing left to handle.
    Gone,
}

impl Reason {
    /// Reasons that change-detecting handlers can subscribe to.
    pub const HANDLER_REASONS: [Reason; 4] = [Reason::Create, Reason::Update, Reason::Delete, Reason::Resume];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Resume => "resume",
            Self::Event => "event",
            Self::Noop => "noop",
            Self::Gone => "gone",
        }
    }

    /// Whether handlers can be selected for this reason.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Self::Noop | Self::Gone)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured explanation of a processing cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Cause {
    pub reason: Reason,
    pub identity: EntityIdentity,
    pub event_type: Option<EventType>,
    /// The full observed body.
    pub body: Body,
    /// Essence of the last handled state.
    pub old: Option<Value>,
    /// Essence of the observed state.
    pub new: Option<Value>,
    pub diff: Diff,
}

impl Cause {
    /// The cause as seen by a handler scoped to `field`.
    pub fn scoped(&self, field: &FieldPath) -> Cause {
        Cause {
            old: self.old.as_ref().and_then(|v| field.resolve(v)).cloned(),
            new: self.new.as_ref().and_then(|v| field.resolve(v)).cloned(),
            diff: self.diff.reduce(field),
            ..self.clone()
        }
    }
}

/// Everything the detector looks at.
#[derive(Debug, Clone, Copy)]
pub struct Detection<'a> {
    pub identity: &'a EntityIdentity,
    pub raw_event: &'a RawEvent,
    /// The last persisted diffbase, if any.
    pub diffbase: Option<&'a Value>,
    /// Whether deletion handling already completed for this entity.
    pub deletion_handled: bool,
    /// Purpose of handler states still unfinished from an earlier cycle.
    pub pending: Option<Reason>,
    /// Annotation prefix of the reactor's own bookkeeping.
    pub own_prefix: &'a str,
    pub ignored_fields: &'a [FieldPath],
}

/// Classify a notification against the persisted diffbase.
pub fn detect_cause(input: Detection<'_>) -> Cause {
    let body = &input.raw_event.object;
    let event_type = input.raw_event.event_type;
    let old = input.diffbase.filter(|v| !v.is_null()).cloned();
    let new = body
        .is_object()
        .then(|| essence(body, input.own_prefix, input.ignored_fields));
    let changes = diff(old.as_ref(), new.as_ref());

    let reason = if !body.is_object() {
        Reason::Gone
    } else if event_type == Some(EventType::Deleted) || is_deletion_ongoing(body) {
        if input.deletion_handled {
            Reason::Gone
        } else {
            Reason::Delete
        }
    } else if event_type.is_none() {
        // Creation and updates never mix with resuming: unfinished work
        // carries on, and an entity never handled at all is created.
        match input.pending {
            Some(reason @ (Reason::Create | Reason::Update)) => reason,
            _ if old.is_none() => Reason::Create,
            _ => Reason::Resume,
        }
    } else if old.is_none() {
        Reason::Create
    } else if !changes.is_empty() {
        Reason::Update
    } else {
        Reason::Noop
    };

    Cause {
        reason,
        identity: input.identity.clone(),
        event_type,
        body: body.clone(),
        old,
        new,
        diff: changes,
    }
}

/// The cause passed to event-watching handlers: one per raw notification.
pub fn event_cause(identity: &EntityIdentity, raw_event: &RawEvent) -> Cause {
    Cause {
        reason: Reason::Event,
        identity: identity.clone(),
        event_type: raw_event.event_type,
        body: raw_event.object.clone(),
        old: None,
        new: None,
        diff: Diff::default(),
    }
}
