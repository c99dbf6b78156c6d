//! # Keel
//!
//! A per-entity reconciliation reactor: raw change notifications go in,
//! registered handlers run exactly once per settled state, and progress is
//! recorded so restarts and retries never repeat finished work.
//!
//! ## Core Concepts
//!
//! - A [`RawEvent`] is a fact: some object changed (or was listed).
//! - A [`Cause`] is the interpretation: created, updated, deleted, resumed.
//! - A [`HandlerDescriptor`] says which causes a [`Handler`] reacts to.
//! - A [`ProgressStore`] remembers which handlers are done for the current
//!   cause and what the object looked like when it was last fully handled.
//!
//! ## Architecture
//!
//! ```text
//! watch stream
//!     │
//!     ▼ dispatch()
//! Multiplexer ── lanes[identity] ──► one worker per entity
//!                                        │
//!                                        ▼ batch_window: keep the newest
//!                                  process_resource_event
//!                                        │
//!     ┌──────────────────────────────────┤
//!     │                                  │
//!     ▼                                  ▼
//! indexers, event watchers        consistency gate ◄── stream pressure
//! (every fresh notification)             │
//!                                        ▼
//!                                  detect_cause(diffbase)
//!                                        │
//!                                        ▼
//!                              lifecycle.select() ──► run handlers
//!                                        │
//!                                        ▼
//!                          ProgressStore.commit() ──► PatchSink.patch()
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One worker per entity** - notifications of one entity are strictly
//!    ordered; different entities never wait for each other
//! 2. **One commit per cycle** - handler states are collected in memory and
//!    written once, all or nothing
//! 3. **Attempts only grow** - within an unresolved cause, a handler's
//!    attempt count never decreases
//! 4. **Handlers never escape** - failures, timeouts and panics become
//!    handler states, never cycle errors
//!
//! ## Example
//!
//! ```ignore
//! use keel_core::{handler_fn, HandlerDescriptor, HandlerError, ReactorBuilder, Registry};
//! use std::time::Duration;
//!
//! let registry = Registry::builder()
//!     .with_handler(
//!         HandlerDescriptor::on_create("provision", handler_fn(|ctx| async move {
//!             tracing::info!(name = %ctx.identity().name, "provisioning");
//!             Ok(None)
//!         }))
//!         .kind("Widget"),
//!     )
//!     .with_handler(
//!         HandlerDescriptor::on_delete("cleanup", handler_fn(|ctx| async move {
//!             if ctx.retry < 3 {
//!                 return Err(HandlerError::temporary("not yet", Duration::from_secs(5)));
//!             }
//!             Ok(None)
//!         }))
//!         .kind("Widget"),
//!     )
//!     .build()?;
//!
//! let handle = ReactorBuilder::new(registry).with_sink(my_sink).build().start();
//! handle.dispatch(raw_event);
//! handle.shutdown().await;
//! ```

mod cause;
mod consistency;
mod diff;
mod error;
mod execution;
mod handler;
mod indexing;
mod lifecycle;
mod memory;
mod patch;
mod processing;
mod progress;
mod queueing;
mod reactor;
mod registry;
mod resource;
mod settings;
mod state;
mod time;

// Re-export time codec
pub use time::{format_iso8601, parse_iso8601, BaseTime, Clock};

// Re-export notification and identity types
pub use resource::{
    finalizers, get_version, has_finalizer, is_deletion_ongoing, labels, resource_version, Body,
    EntityIdentity, EventType, RawEvent, StreamItem,
};

// Re-export change detection
pub use cause::{detect_cause, event_cause, Cause, Detection, Reason};
pub use diff::{diff, essence, Diff, DiffItem, DiffOp, FieldPath};

// Re-export handler types
pub use handler::{
    handler_fn, FieldScope, Handler, HandlerContext, HandlerDescriptor, HandlerFn, HandlerResult,
    LabelMatch, Selector,
};
pub use registry::{Registry, RegistryBuilder};
pub use lifecycle::{AllAtOnce, Asap, Lifecycle, OneByOne, Randomized, Shuffled};

// Re-export execution and progress
pub use execution::{apply_outcome, run_handler, run_handlers, Backoff, Outcome};
pub use state::{HandlerId, HandlerState, HandlerStates, HandlerStatus, ProgressRecord};
pub use progress::{Commit, MemoryProgressStore, ProgressStore};

// Re-export outputs
pub use patch::{EventKind, EventRecord, NullSink, Patch, PatchSink};

// Re-export the processing cycle and its machinery
pub use consistency::{consistency_delay, wait_for_consistency, Flag, GateOutcome};
pub use indexing::Indexers;
pub use memory::{EntityMemory, Memo};
pub use processing::{process_resource_event, Cycle, CycleOutcome};
pub use queueing::Multiplexer;
pub use reactor::{Reactor, ReactorBuilder, ReactorHandle};

// Re-export settings
pub use settings::{
    BatchingSettings, DiffingSettings, ExecutionSettings, PersistenceSettings, PostingSettings,
    Settings,
};

// Re-export error types
pub use error::{
    CodecError, HandlerError, ProcessingError, RegistryError, Result, SinkError, StoreError,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
