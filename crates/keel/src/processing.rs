//! One processing cycle for one notification of one entity.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, warn};

use crate::cause::{detect_cause, event_cause, Cause, Detection, Reason};
use crate::consistency::{wait_for_consistency, Flag};
use crate::error::{Result, SinkError};
use crate::execution::{apply_outcome, run_handlers, Outcome};
use crate::handler::{HandlerContext, HandlerDescriptor};
use crate::indexing::Indexers;
use crate::lifecycle::Lifecycle;
use crate::memory::{EntityMemory, Memo};
use crate::patch::{EventKind, EventRecord, Patch, PatchSink};
use crate::progress::{Commit, ProgressStore};
use crate::registry::Registry;
use crate::resource::{finalizers, has_finalizer, resource_version, Body, EntityIdentity, RawEvent};
use crate::settings::Settings;
use crate::state::{HandlerState, HandlerStates, HandlerStatus, ProgressRecord};
use crate::time::Clock;

/// Everything one cycle works with.
pub struct Cycle<'a> {
    pub lifecycle: &'a dyn Lifecycle,
    pub registry: &'a Registry,
    pub settings: &'a Settings,
    pub identity: &'a EntityIdentity,
    pub indexers: &'a Arc<Indexers>,
    pub memory: &'a mut EntityMemory,
    pub memo: &'a Memo,
    pub raw_event: &'a RawEvent,
    pub sink: &'a dyn PatchSink,
    pub store: &'a dyn ProgressStore,
    pub clock: &'a Clock,
    pub consistency_time: Option<f64>,
    pub pressure: &'a Flag,
    pub shutdown: &'a Flag,
    /// A notification seen for the first time, as opposed to a retry or a
    /// re-entry after an interrupted wait. Indexers and event-watching
    /// handlers only see fresh notifications.
    pub fresh: bool,
}

/// What the caller needs to know after a cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleOutcome {
    /// Resource version of the body returned by the sink for our own patch.
    pub patched_version: Option<String>,
    pub patched_body: Option<Body>,
    /// Seconds until the cycle should run again against the latest body.
    pub delay: Option<f64>,
    /// The consistency wait was interrupted; nothing was handled.
    pub interrupted: bool,
    pub cause: Option<Reason>,
}

/// Process one notification: watchers, consistency, cause, handlers, commit.
pub async fn process_resource_event(cycle: Cycle<'_>) -> Result<CycleOutcome> {
    let Cycle {
        lifecycle,
        registry,
        settings,
        identity,
        indexers,
        memory,
        memo,
        raw_event,
        sink,
        store,
        clock,
        consistency_time,
        pressure,
        shutdown,
        fresh,
    } = cycle;

    let mut outcome = CycleOutcome::default();
    let body = &raw_event.object;
    memory.last_seen = clock.now();
    memory.idle = false;
    if body.is_object() {
        memory.latest_body = Some(body.clone());
        memory.last_event_type = raw_event.event_type;
    }

    if fresh {
        indexers.index(identity, raw_event);
        run_watchers(registry, settings, identity, indexers, memory, memo, raw_event, clock).await;
    }

    if body.is_object() && !registry.has_changing_handlers(identity, body) {
        return Ok(outcome);
    }

    let gate = wait_for_consistency(
        clock,
        consistency_time,
        settings.persistence.consistency_timeout,
        pressure,
        shutdown,
    )
    .await;
    if !gate.proceeds() {
        debug!(?gate, "change detection skipped");
        outcome.interrupted = true;
        return Ok(outcome);
    }

    let mut record = store.load(identity, body).await?;
    if record.diffbase.is_none() && record.handlers.is_empty() && !record.deletion_handled {
        // The body predates this worker's own last commit.
        record.diffbase = memory.diffbase.clone();
    }
    let cause = detect_cause(Detection {
        identity,
        raw_event,
        diffbase: record.diffbase.as_ref(),
        deletion_handled: record.deletion_handled,
        pending: record.handlers.pending_purpose(),
        own_prefix: &settings.persistence.annotation_prefix,
        ignored_fields: &settings.diffing.ignored_fields,
    });
    outcome.cause = Some(cause.reason);
    debug!(reason = %cause.reason, diff = cause.diff.len(), "cause detected");

    let finalizer = settings.persistence.finalizer.as_str();
    let physically_gone = raw_event.is_deleted() || !body.is_object();
    let mut patch = Patch::new();
    let mut events = Vec::new();

    match cause.reason {
        Reason::Gone => {
            indexers.forget(identity);
            if physically_gone {
                store.commit(identity, body, Commit::Purge, &mut patch).await?;
                memory.diffbase = None;
                return Ok(outcome);
            }
            // Still held by other finalizers: the deletion marker must stay,
            // or the next notification would count as a new deletion.
            if has_finalizer(body, finalizer) {
                patch.set_finalizers(without(body, finalizer));
            }
        }
        Reason::Noop => {
            memory.diffbase = record.diffbase.clone();
            if registry.requires_finalizer(identity, body) && !has_finalizer(body, finalizer) {
                patch.set_finalizers(with(body, finalizer));
            }
        }
        _ => {
            // A deletion we never got to block: one best-effort pass, no retries.
            let single_pass = cause.reason == Reason::Delete && raw_event.is_deleted();
            if cause.reason != Reason::Delete
                && registry.requires_finalizer(identity, body)
                && !has_finalizer(body, finalizer)
            {
                patch.set_finalizers(with(body, finalizer));
            }

            let handlers = registry.changing_handlers(&cause);
            let mut states = record.handlers.for_purpose(cause.reason);
            let now = clock.now();
            states.ensure(&handlers, now, cause.reason);

            let selected = if single_pass {
                handlers
                    .iter()
                    .filter(|h| !states.is_finished(&h.id))
                    .cloned()
                    .collect()
            } else {
                lifecycle.select(&handlers, &states, now)
            };
            debug!(
                lifecycle = lifecycle.name(),
                applicable = handlers.len(),
                selected = selected.len(),
                "handlers selected"
            );

            let runs = selected
                .into_iter()
                .map(|handler| {
                    let state = states
                        .get(&handler.id)
                        .cloned()
                        .unwrap_or_else(|| HandlerState::pending(now, cause.reason));
                    let ctx = context(&handler, &cause, &state, now, memo, memory, indexers);
                    (handler, ctx)
                })
                .collect();
            let results = run_handlers(runs, &settings.execution, lifecycle.is_concurrent() && !single_pass).await;

            let now = clock.now();
            for (handler, result) in results {
                let previous = states
                    .get(&handler.id)
                    .cloned()
                    .unwrap_or_else(|| HandlerState::pending(now, cause.reason));
                let mut next = apply_outcome(&previous, &result, &handler, &settings.execution, now);
                if single_pass && !next.is_finished() {
                    next.status = HandlerStatus::Failure;
                    next.delayed = None;
                }
                if let Outcome::Success(Some(value)) = &result {
                    patch.set_status(handler.id.as_str(), value.clone());
                }
                if settings.posting.enabled {
                    events.push(describe(&handler, cause.reason, &next));
                }
                states.insert(handler.id.clone(), next);
            }

            let commit = if single_pass {
                indexers.forget(identity);
                memory.diffbase = None;
                Commit::Purge
            } else if states.all_finished(&handlers) {
                info!(reason = %cause.reason, "all handlers finished");
                if cause.reason == Reason::Delete {
                    if has_finalizer(body, finalizer) {
                        patch.set_finalizers(without(body, finalizer));
                    }
                    Commit::Record(ProgressRecord {
                        diffbase: record.diffbase.clone(),
                        handlers: HandlerStates::new(),
                        deletion_handled: true,
                    })
                } else {
                    memory.diffbase = cause.new.clone();
                    Commit::Record(ProgressRecord {
                        diffbase: cause.new.clone(),
                        handlers: HandlerStates::new(),
                        deletion_handled: false,
                    })
                }
            } else {
                outcome.delay = states.delay(&handlers, clock.now());
                debug!(delay = ?outcome.delay, "handlers pending");
                Commit::Record(ProgressRecord {
                    diffbase: record.diffbase.clone(),
                    handlers: states,
                    deletion_handled: record.deletion_handled,
                })
            };
            store.commit(identity, body, commit, &mut patch).await?;

            if single_pass {
                return Ok(outcome);
            }
        }
    }

    if !patch.is_empty() {
        match sink.patch(identity, &patch).await {
            Ok(Some(patched)) => {
                outcome.patched_version = resource_version(&patched).map(str::to_owned);
                memory.latest_body = Some(patched.clone());
                outcome.patched_body = Some(patched);
            }
            Ok(None) => {}
            Err(SinkError::NotFound { .. }) => {
                debug!("entity disappeared before it could be patched");
            }
            Err(err) => return Err(err.into()),
        }
    }

    for event in events {
        if let Err(err) = sink.post_event(identity, event).await {
            warn!(error = %err, "failed to post event");
        }
    }

    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn run_watchers(
    registry: &Registry,
    settings: &Settings,
    identity: &EntityIdentity,
    indexers: &Arc<Indexers>,
    memory: &EntityMemory,
    memo: &Memo,
    raw_event: &RawEvent,
    clock: &Clock,
) {
    let cause = event_cause(identity, raw_event);
    let watchers = registry.watching_handlers(&cause);
    if watchers.is_empty() {
        return;
    }
    let now = clock.now();
    let runs = watchers
        .into_iter()
        .map(|handler| {
            let state = HandlerState::pending(now, Reason::Event);
            let ctx = context(&handler, &cause, &state, now, memo, memory, indexers);
            (handler, ctx)
        })
        .collect();
    for (handler, result) in run_handlers(runs, &settings.execution, false).await {
        if !matches!(result, Outcome::Success(_)) {
            debug!(handler = %handler.id, ?result, "event watcher failed; not retried");
        }
    }
}

fn context(
    handler: &HandlerDescriptor,
    cause: &Cause,
    state: &HandlerState,
    now: f64,
    memo: &Memo,
    memory: &EntityMemory,
    indexers: &Arc<Indexers>,
) -> HandlerContext {
    HandlerContext {
        handler_id: handler.id.clone(),
        cause: handler.view(cause),
        retry: state.attempts,
        started: state.started,
        runtime: Duration::try_from_secs_f64(state.runtime(now)).unwrap_or_default(),
        memo: memo.clone(),
        entity_memo: memory.memo.clone(),
        indexers: Arc::clone(indexers),
        span: info_span!("handler", id = %handler.id, reason = %cause.reason, retry = state.attempts),
    }
}

fn describe(handler: &HandlerDescriptor, reason: Reason, state: &HandlerState) -> EventRecord {
    let message = state.message.as_deref().unwrap_or_default();
    match state.status {
        HandlerStatus::Success => EventRecord::new(
            EventKind::Normal,
            "Success",
            format!("Handler {:?} succeeded ({reason}).", handler.id.as_str()),
        ),
        HandlerStatus::Failure => EventRecord::new(
            EventKind::Error,
            "Failure",
            format!("Handler {:?} failed permanently: {message}", handler.id.as_str()),
        ),
        HandlerStatus::AwaitingRetry | HandlerStatus::Pending => EventRecord::new(
            EventKind::Warning,
            "Retrying",
            format!("Handler {:?} failed temporarily: {message}", handler.id.as_str()),
        ),
    }
}

fn with(body: &Body, finalizer: &str) -> Vec<String> {
    finalizers(body)
        .map(str::to_owned)
        .chain(std::iter::once(finalizer.to_owned()))
        .collect()
}

fn without(body: &Body, finalizer: &str) -> Vec<String> {
    finalizers(body)
        .filter(|f| *f != finalizer)
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::lifecycle::AllAtOnce;
    use crate::patch::NullSink;
    use crate::progress::MemoryProgressStore;
    use serde_json::{json, Value};

    struct Fixture {
        registry: Registry,
        settings: Settings,
        indexers: Arc<Indexers>,
        store: MemoryProgressStore,
        clock: Clock,
        memo: Memo,
        memory: EntityMemory,
        flag: Flag,
    }

    impl Fixture {
        fn new(registry: Registry) -> Self {
            Self {
                registry,
                settings: Settings::default(),
                indexers: Arc::new(Indexers::new()),
                store: MemoryProgressStore::new(),
                clock: Clock::new(),
                memo: Memo::new(),
                memory: EntityMemory::default(),
                flag: Flag::new(),
            }
        }

        async fn run(&mut self, raw_event: RawEvent) -> CycleOutcome {
            let identity = EntityIdentity::from_body(&raw_event.object)
                .unwrap_or_else(|| EntityIdentity::new("Widget", "ns", "w"));
            process_resource_event(Cycle {
                lifecycle: &AllAtOnce,
                registry: &self.registry,
                settings: &self.settings,
                identity: &identity,
                indexers: &self.indexers,
                memory: &mut self.memory,
                memo: &self.memo,
                raw_event: &raw_event,
                sink: &NullSink,
                store: &self.store,
                clock: &self.clock,
                consistency_time: None,
                pressure: &self.flag,
                shutdown: &self.flag,
                fresh: true,
            })
            .await
            .unwrap()
        }
    }

    fn widget(size: u32) -> Value {
        json!({"kind": "Widget", "metadata": {"name": "w", "namespace": "ns"}, "spec": {"size": size}})
    }

    fn counting(reason: &str, memo_key: &'static str) -> HandlerDescriptor {
        let handler = handler_fn(move |ctx: HandlerContext| async move {
            let seen = ctx.memo.get(memo_key).and_then(|v| v.as_u64()).unwrap_or(0);
            ctx.memo.insert(memo_key, json!(seen + 1));
            Ok(None)
        });
        match reason {
            "create" => HandlerDescriptor::on_create(memo_key, handler),
            "update" => HandlerDescriptor::on_update(memo_key, handler),
            _ => HandlerDescriptor::on_delete(memo_key, handler),
        }
    }

    #[tokio::test]
    async fn create_then_noop_then_update() {
        let registry = Registry::builder()
            .with_handler(counting("create", "created"))
            .with_handler(counting("update", "updated"))
            .build()
            .unwrap();
        let mut fx = Fixture::new(registry);

        let first = fx.run(RawEvent::added(widget(1))).await;
        assert_eq!(first.cause, Some(Reason::Create));
        assert_eq!(first.delay, None);

        let second = fx.run(RawEvent::modified(widget(1))).await;
        assert_eq!(second.cause, Some(Reason::Noop));

        let third = fx.run(RawEvent::modified(widget(2))).await;
        assert_eq!(third.cause, Some(Reason::Update));

        assert_eq!(fx.memo.get("created"), Some(json!(1)));
        assert_eq!(fx.memo.get("updated"), Some(json!(1)));
        let record = fx.store.get(&EntityIdentity::new("Widget", "ns", "w")).unwrap();
        assert_eq!(record.diffbase, Some(json!({"kind": "Widget", "spec": {"size": 2}})));
    }

    #[tokio::test]
    async fn worker_copy_covers_a_lagging_store() {
        let registry = Registry::builder()
            .with_handler(counting("create", "created"))
            .build()
            .unwrap();
        let mut fx = Fixture::new(registry);
        let identity = EntityIdentity::new("Widget", "ns", "w");

        fx.run(RawEvent::added(widget(1))).await;
        fx.store
            .commit(&identity, &widget(1), Commit::Purge, &mut Patch::new())
            .await
            .unwrap();

        let again = fx.run(RawEvent::modified(widget(1))).await;
        assert_eq!(again.cause, Some(Reason::Noop));
        assert_eq!(fx.memo.get("created"), Some(json!(1)));
    }

    #[tokio::test]
    async fn never_finalized_deletion_gets_one_pass() {
        let failing = HandlerDescriptor::on_delete(
            "cleanup",
            handler_fn(|_| async { Err(crate::HandlerError::retry("later")) }),
        );
        let registry = Registry::builder().with_handler(failing).build().unwrap();
        let mut fx = Fixture::new(registry);

        let outcome = fx.run(RawEvent::deleted(widget(1))).await;
        assert_eq!(outcome.cause, Some(Reason::Delete));
        assert_eq!(outcome.delay, None);
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn no_changing_handlers_means_no_detection() {
        let registry = Registry::builder().build().unwrap();
        let mut fx = Fixture::new(registry);
        let outcome = fx.run(RawEvent::added(widget(1))).await;
        assert_eq!(outcome.cause, None);
        assert_eq!(fx.memory.latest_body, Some(widget(1)));
    }

    #[test]
    fn finalizer_lists() {
        let body = json!({"metadata": {"finalizers": ["other", "keel.dev/finalizer"]}});
        assert_eq!(without(&body, "keel.dev/finalizer"), vec!["other".to_owned()]);
        assert_eq!(with(&json!({}), "f"), vec!["f".to_owned()]);
    }
}
