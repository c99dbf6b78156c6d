//! Lifecycles: which of the pending handlers run in this cycle.

use std::sync::Arc;

use crate::handler::HandlerDescriptor;
use crate::state::HandlerStates;

/// Selection policy over the handlers of one cause.
///
/// Handlers are passed in declaration order. Implementations only ever pick
/// handlers that are unfinished and awake at `now`.
pub trait Lifecycle: Send + Sync {
    fn select(
        &self,
        handlers: &[Arc<HandlerDescriptor>],
        states: &HandlerStates,
        now: f64,
    ) -> Vec<Arc<HandlerDescriptor>>;

    fn name(&self) -> &'static str;

    /// Whether the selected handlers may run concurrently.
    fn is_concurrent(&self) -> bool {
        false
    }
}

fn awake<'a>(
    handlers: &'a [Arc<HandlerDescriptor>],
    states: &'a HandlerStates,
    now: f64,
) -> impl Iterator<Item = &'a Arc<HandlerDescriptor>> + 'a {
    handlers.iter().filter(move |h| states.is_awake(&h.id, now))
}

/// Every awake handler, all in the same cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllAtOnce;

impl Lifecycle for AllAtOnce {
    fn select(
        &self,
        handlers: &[Arc<HandlerDescriptor>],
        states: &HandlerStates,
        now: f64,
    ) -> Vec<Arc<HandlerDescriptor>> {
        awake(handlers, states, now).cloned().collect()
    }

    fn name(&self) -> &'static str {
        "all-at-once"
    }

    fn is_concurrent(&self) -> bool {
        true
    }
}

/// Strictly in declaration order: the first unfinished handler, if awake.
#[derive(Debug, Clone, Copy, Default)]
pub struct OneByOne;

impl Lifecycle for OneByOne {
    fn select(
        &self,
        handlers: &[Arc<HandlerDescriptor>],
        states: &HandlerStates,
        now: f64,
    ) -> Vec<Arc<HandlerDescriptor>> {
        handlers
            .iter()
            .find(|h| !states.is_finished(&h.id))
            .filter(|h| states.is_awake(&h.id, now))
            .cloned()
            .into_iter()
            .collect()
    }

    fn name(&self) -> &'static str {
        "one-by-one"
    }
}

/// One random awake handler per cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Randomized;

impl Lifecycle for Randomized {
    fn select(
        &self,
        handlers: &[Arc<HandlerDescriptor>],
        states: &HandlerStates,
        now: f64,
    ) -> Vec<Arc<HandlerDescriptor>> {
        let candidates: Vec<_> = awake(handlers, states, now).collect();
        if candidates.is_empty() {
            return Vec::new();
        }
        vec![Arc::clone(candidates[fastrand::usize(..candidates.len())])]
    }

    fn name(&self) -> &'static str {
        "randomized"
    }
}

/// Every awake handler, one after another in random order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Shuffled;

impl Lifecycle for Shuffled {
    fn select(
        &self,
        handlers: &[Arc<HandlerDescriptor>],
        states: &HandlerStates,
        now: f64,
    ) -> Vec<Arc<HandlerDescriptor>> {
        let mut selected: Vec<_> = awake(handlers, states, now).cloned().collect();
        fastrand::shuffle(&mut selected);
        selected
    }

    fn name(&self) -> &'static str {
        "shuffled"
    }
}

/// The awake handler with the fewest attempts; ties go to declaration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Asap;

impl Lifecycle for Asap {
    fn select(
        &self,
        handlers: &[Arc<HandlerDescriptor>],
        states: &HandlerStates,
        now: f64,
    ) -> Vec<Arc<HandlerDescriptor>> {
        awake(handlers, states, now)
            .min_by_key(|h| states.attempts(&h.id))
            .cloned()
            .into_iter()
            .collect()
    }

    fn name(&self) -> &'static str {
        "asap"
    }
}
