//! Handlers: the reaction logic registered by application authors.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::cause::{Cause, Reason};
use crate::diff::{Diff, FieldPath};
use crate::error::HandlerError;
use crate::execution::Backoff;
use crate::indexing::Indexers;
use crate::memory::Memo;
use crate::resource::{labels, Body, EntityIdentity};
use crate::state::HandlerId;

/// What a handler returns: an optional result stored under `status.<id>`.
pub type HandlerResult = Result<Option<Value>, HandlerError>;

/// Reaction logic for one handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> HandlerResult;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a handler.
///
/// ```ignore
/// let h = handler_fn(|ctx| async move {
///     tracing::info!(name = %ctx.identity().name, "created");
///     Ok(None)
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext) -> HandlerResult {
        (self.0)(ctx).await
    }
}

/// Everything a handler gets to see for one invocation.
#[derive(Clone)]
pub struct HandlerContext {
    pub handler_id: HandlerId,
    pub cause: Cause,
    /// Number of earlier invocations for this cause.
    pub retry: u32,
    /// Loop time the handler was first selected for this cause.
    pub started: f64,
    /// Time since `started`.
    pub runtime: Duration,
    /// Shared across all entities.
    pub memo: Memo,
    /// Private to this entity's lane.
    pub entity_memo: Memo,
    pub indexers: Arc<Indexers>,
    pub span: tracing::Span,
}

impl HandlerContext {
    pub fn identity(&self) -> &EntityIdentity {
        &self.cause.identity
    }

    pub fn reason(&self) -> Reason {
        self.cause.reason
    }

    pub fn body(&self) -> &Body {
        &self.cause.body
    }

    pub fn metadata(&self) -> &Value {
        self.cause.body.get("metadata").unwrap_or(&Value::Null)
    }

    pub fn spec(&self) -> &Value {
        self.cause.body.get("spec").unwrap_or(&Value::Null)
    }

    pub fn old(&self) -> Option<&Value> {
        self.cause.old.as_ref()
    }

    pub fn new(&self) -> Option<&Value> {
        self.cause.new.as_ref()
    }

    pub fn diff(&self) -> &Diff {
        &self.cause.diff
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("handler_id", &self.handler_id)
            .field("reason", &self.cause.reason)
            .field("identity", &self.cause.identity)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Label constraint of a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelMatch {
    Equals(String),
    Present,
    Absent,
}

/// Which entities a handler applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    /// `None` matches every kind.
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, LabelMatch>,
}

impl Selector {
    pub fn matches_identity(&self, identity: &EntityIdentity) -> bool {
        self.kind.as_deref().map_or(true, |k| k == identity.kind)
            && self
                .namespace
                .as_deref()
                .map_or(true, |ns| ns == identity.namespace)
    }

    pub fn matches(&self, identity: &EntityIdentity, body: &Body) -> bool {
        if !self.matches_identity(identity) {
            return false;
        }
        if self.labels.is_empty() {
            return true;
        }
        let present: BTreeMap<&str, &str> = labels(body).collect();
        self.labels.iter().all(|(key, rule)| match rule {
            LabelMatch::Equals(value) => present.get(key.as_str()) == Some(&value.as_str()),
            LabelMatch::Present => present.contains_key(key.as_str()),
            LabelMatch::Absent => !present.contains_key(key.as_str()),
        })
    }
}

/// How a field-scoped handler treats causes other than updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FieldScope {
    /// Run regardless of the field.
    #[default]
    Always,
    /// Run only if the field has a value in the relevant state.
    Present,
}

type Predicate = Arc<dyn Fn(&Cause) -> bool + Send + Sync>;

/// A registered handler with its filters and execution policy.
///
/// Immutable once registered; shared read-only by every worker.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub id: HandlerId,
    pub reasons: Vec<Reason>,
    pub selector: Selector,
    pub field: Option<FieldPath>,
    pub field_scope: FieldScope,
    pub timeout: Option<Duration>,
    /// Retries allowed after the first attempt. `None` means unlimited.
    pub retries: Option<u32>,
    pub backoff: Option<Backoff>,
    /// Deletion handlers block the object's removal until they finish.
    pub requires_finalizer: bool,
    when: Option<Predicate>,
    callback: Arc<dyn Handler>,
}

impl HandlerDescriptor {
    pub fn new(
        id: impl Into<String>,
        reasons: impl IntoIterator<Item = Reason>,
        handler: impl Handler + 'static,
    ) -> Self {
        let reasons: Vec<Reason> = reasons.into_iter().collect();
        let requires_finalizer = reasons.contains(&Reason::Delete);
        Self {
            id: HandlerId::new(id),
            reasons,
            selector: Selector::default(),
            field: None,
            field_scope: FieldScope::default(),
            timeout: None,
            retries: None,
            backoff: None,
            requires_finalizer,
            when: None,
            callback: Arc::new(handler),
        }
    }

    pub fn on_create(id: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(id, [Reason::Create], handler)
    }

    pub fn on_update(id: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(id, [Reason::Update], handler)
    }

    pub fn on_delete(id: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(id, [Reason::Delete], handler)
    }

    pub fn on_resume(id: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(id, [Reason::Resume], handler)
    }

    /// Event-watching handler: fires once per raw notification, untracked.
    pub fn on_event(id: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(id, [Reason::Event], handler)
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.selector.kind = Some(kind.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.selector.namespace = Some(namespace.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, rule: LabelMatch) -> Self {
        self.selector.labels.insert(key.into(), rule);
        self
    }

    pub fn field(mut self, field: impl Into<FieldPath>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn field_scope(mut self, scope: FieldScope) -> Self {
        self.field_scope = scope;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Deletion handling that does not block the object's removal.
    pub fn optional(mut self) -> Self {
        self.requires_finalizer = false;
        self
    }

    /// Extra predicate evaluated against the cause.
    pub fn when(mut self, predicate: impl Fn(&Cause) -> bool + Send + Sync + 'static) -> Self {
        self.when = Some(Arc::new(predicate));
        self
    }

    pub fn is_watching(&self) -> bool {
        self.reasons.contains(&Reason::Event)
    }

    pub fn is_changing(&self) -> bool {
        self.reasons.iter().any(|r| *r != Reason::Event)
    }

    /// Whether this handler should run for `cause`.
    pub fn matches(&self, cause: &Cause) -> bool {
        if !self.reasons.contains(&cause.reason) {
            return false;
        }
        if !self.selector.matches(&cause.identity, &cause.body) {
            return false;
        }
        if let Some(field) = &self.field {
            let in_scope = match cause.reason {
                Reason::Update => cause.diff.touches(field),
                Reason::Event => true,
                _ => match self.field_scope {
                    FieldScope::Always => true,
                    FieldScope::Present => cause
                        .new
                        .as_ref()
                        .or(cause.old.as_ref())
                        .and_then(|v| field.resolve(v))
                        .is_some(),
                },
            };
            if !in_scope {
                return false;
            }
        }
        self.when.as_ref().map_or(true, |predicate| predicate(cause))
    }

    /// The cause as this handler sees it (narrowed to its field, if any).
    pub fn view(&self, cause: &Cause) -> Cause {
        match &self.field {
            Some(field) if cause.reason != Reason::Event => cause.scoped(field),
            _ => cause.clone(),
        }
    }

    pub(crate) fn callback(&self) -> &Arc<dyn Handler> {
        &self.callback
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("id", &self.id)
            .field("reasons", &self.reasons)
            .field("selector", &self.selector)
            .field("field", &self.field)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}
