//! Reactor: the shared, immutable wiring of one running reconciler.

use std::sync::Arc;

use crate::consistency::Flag;
use crate::error::Result;
use crate::indexing::Indexers;
use crate::lifecycle::{AllAtOnce, Lifecycle};
use crate::memory::{EntityMemory, Memo};
use crate::patch::{NullSink, PatchSink};
use crate::processing::{process_resource_event, Cycle, CycleOutcome};
use crate::progress::{MemoryProgressStore, ProgressStore};
use crate::queueing::Multiplexer;
use crate::registry::Registry;
use crate::resource::{EntityIdentity, RawEvent};
use crate::settings::Settings;
use crate::time::Clock;

/// Builder for a [`Reactor`].
///
/// ```ignore
/// let handle = ReactorBuilder::new(registry)
///     .with_settings(settings)
///     .with_store(AnnotationsProgressStore::new(clock, "keel.dev"))
///     .with_sink(my_sink)
///     .build()
///     .start();
///
/// handle.dispatch(raw_event);
/// handle.shutdown().await;
/// ```
pub struct ReactorBuilder {
    registry: Registry,
    settings: Settings,
    lifecycle: Arc<dyn Lifecycle>,
    indexers: Indexers,
    memo: Memo,
    sink: Arc<dyn PatchSink>,
    store: Arc<dyn ProgressStore>,
    clock: Option<Clock>,
}

impl ReactorBuilder {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            settings: Settings::default(),
            lifecycle: Arc::new(AllAtOnce),
            indexers: Indexers::new(),
            memo: Memo::new(),
            sink: Arc::new(NullSink),
            store: Arc::new(MemoryProgressStore::new()),
            clock: None,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: impl Lifecycle + 'static) -> Self {
        self.lifecycle = Arc::new(lifecycle);
        self
    }

    pub fn with_indexers(mut self, indexers: Indexers) -> Self {
        self.indexers = indexers;
        self
    }

    pub fn with_memo(mut self, memo: Memo) -> Self {
        self.memo = memo;
        self
    }

    pub fn with_sink(mut self, sink: impl PatchSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Share a sink the caller keeps a handle on.
    pub fn with_shared_sink(mut self, sink: Arc<dyn PatchSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_store(mut self, store: impl ProgressStore + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn with_shared_store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.store = store;
        self
    }

    /// Use an existing clock; stores that encode times must share it.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Reactor {
        Reactor {
            registry: Arc::new(self.registry),
            settings: Arc::new(self.settings),
            lifecycle: self.lifecycle,
            indexers: Arc::new(self.indexers),
            memo: self.memo,
            sink: self.sink,
            store: self.store,
            clock: self.clock.unwrap_or_default(),
            shutdown: Flag::new(),
        }
    }
}

/// Handlers, settings, storage and outputs shared by every lane.
///
/// Cheap to clone: everything is behind `Arc`s.
#[derive(Clone)]
pub struct Reactor {
    pub(crate) registry: Arc<Registry>,
    pub(crate) settings: Arc<Settings>,
    pub(crate) lifecycle: Arc<dyn Lifecycle>,
    pub(crate) indexers: Arc<Indexers>,
    pub(crate) memo: Memo,
    pub(crate) sink: Arc<dyn PatchSink>,
    pub(crate) store: Arc<dyn ProgressStore>,
    pub(crate) clock: Clock,
    pub(crate) shutdown: Flag,
}

impl Reactor {
    pub fn builder(registry: Registry) -> ReactorBuilder {
        ReactorBuilder::new(registry)
    }

    /// Start accepting notifications. Lanes are spawned on demand.
    pub fn start(self) -> ReactorHandle {
        ReactorHandle {
            multiplexer: Arc::new(Multiplexer::new(self)),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn indexers(&self) -> &Indexers {
        &self.indexers
    }

    pub fn memo(&self) -> &Memo {
        &self.memo
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_raised()
    }

    /// Run one processing cycle outside of any lane.
    ///
    /// The caller is responsible for never running two cycles of the same
    /// entity at once.
    pub async fn process(
        &self,
        identity: &EntityIdentity,
        memory: &mut EntityMemory,
        raw_event: &RawEvent,
        consistency_time: Option<f64>,
        pressure: &Flag,
        fresh: bool,
    ) -> Result<CycleOutcome> {
        process_resource_event(Cycle {
            lifecycle: self.lifecycle.as_ref(),
            registry: &self.registry,
            settings: &self.settings,
            identity,
            indexers: &self.indexers,
            memory,
            memo: &self.memo,
            raw_event,
            sink: self.sink.as_ref(),
            store: self.store.as_ref(),
            clock: &self.clock,
            consistency_time,
            pressure,
            shutdown: &self.shutdown,
            fresh,
        })
        .await
    }
}

/// Handle to a started reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    multiplexer: Arc<Multiplexer>,
}

impl ReactorHandle {
    /// Route a raw notification to its entity's lane.
    pub fn dispatch(&self, raw_event: RawEvent) {
        self.multiplexer.dispatch(raw_event);
    }

    /// Tell the entity's lane that no more notifications will come.
    pub fn end_of_stream(&self, identity: &EntityIdentity) {
        self.multiplexer.end_of_stream(identity);
    }

    /// Number of live lanes.
    pub fn active_lanes(&self) -> usize {
        self.multiplexer.active_lanes()
    }

    pub fn reactor(&self) -> &Reactor {
        self.multiplexer.reactor()
    }

    /// Stop all lanes, aborting those still busy after the exit timeout.
    pub async fn shutdown(&self) {
        self.multiplexer.shutdown().await;
    }
}
