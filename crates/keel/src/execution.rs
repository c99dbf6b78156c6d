//! Handler execution and retry bookkeeping.
//!
//! Running a handler never fails: whatever it does is classified into an
//! [`Outcome`], and [`apply_outcome`] turns the outcome into the next
//! [`HandlerState`]. Nothing is persisted here; the processing cycle collects
//! the new states and commits them once.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::HandlerError;
use crate::handler::{HandlerContext, HandlerDescriptor};
use crate::settings::ExecutionSettings;
use crate::state::{HandlerState, HandlerStatus};

/// Delay policy for retries that did not name their own delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed {
        #[serde(with = "crate::settings::seconds")]
        delay: Duration,
    },
    Exponential {
        #[serde(with = "crate::settings::seconds")]
        initial: Duration,
        factor: f64,
        #[serde(with = "crate::settings::seconds")]
        max: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    /// Delay before the next attempt, after `attempts` attempts so far.
    pub fn delay(&self, attempts: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential { initial, factor, max } => {
                let exponent = attempts.saturating_sub(1).min(64) as i32;
                let secs = initial.as_secs_f64() * factor.powi(exponent);
                if secs.is_finite() && secs < max.as_secs_f64() {
                    Duration::from_secs_f64(secs.max(0.0))
                } else {
                    *max
                }
            }
        }
    }
}

/// What came out of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Option<Value>),
    Temporary {
        delay: Option<Duration>,
        message: String,
    },
    Permanent {
        message: String,
    },
    Timeout,
}

impl Outcome {
    fn from_result(result: Result<Option<Value>, HandlerError>) -> Self {
        match result {
            Ok(value) => Self::Success(value.filter(|v| !v.is_null())),
            Err(HandlerError::Temporary { message, delay }) => Self::Temporary { delay, message },
            Err(HandlerError::Permanent { message }) => Self::Permanent { message },
            Err(HandlerError::Unexpected(err)) => Self::Temporary {
                delay: None,
                message: format!("{err:#}"),
            },
        }
    }
}

/// Invoke one handler, bounded by its timeout, catching panics.
pub async fn run_handler(
    handler: &HandlerDescriptor,
    ctx: HandlerContext,
    defaults: &ExecutionSettings,
) -> Outcome {
    let span = ctx.span.clone();
    let retry = ctx.retry;
    let invocation = AssertUnwindSafe(handler.callback().handle(ctx)).catch_unwind();
    let timeout = handler.timeout.or(defaults.default_timeout);

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, invocation).instrument(span).await {
            Ok(result) => result,
            Err(_) => {
                warn!(handler = %handler.id, ?limit, "handler timed out");
                return Outcome::Timeout;
            }
        },
        None => invocation.instrument(span).await,
    };

    match result {
        Ok(result) => {
            let outcome = Outcome::from_result(result);
            match &outcome {
                Outcome::Success(_) => info!(handler = %handler.id, retry, "handler succeeded"),
                Outcome::Temporary { message, .. } => {
                    warn!(handler = %handler.id, retry, %message, "handler failed temporarily")
                }
                Outcome::Permanent { message } => {
                    error!(handler = %handler.id, retry, %message, "handler failed permanently")
                }
                Outcome::Timeout => {}
            }
            outcome
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_owned());
            error!(handler = %handler.id, retry, %message, "handler panicked");
            Outcome::Temporary {
                delay: None,
                message,
            }
        }
    }
}

/// Run a selection of handlers, one after another or all together.
///
/// Results come back in selection order.
pub async fn run_handlers(
    selected: Vec<(Arc<HandlerDescriptor>, HandlerContext)>,
    defaults: &ExecutionSettings,
    concurrent: bool,
) -> Vec<(Arc<HandlerDescriptor>, Outcome)> {
    if concurrent {
        let runs = selected.into_iter().map(|(handler, ctx)| async move {
            let outcome = run_handler(&handler, ctx, defaults).await;
            (handler, outcome)
        });
        join_all(runs).await
    } else {
        let mut results = Vec::with_capacity(selected.len());
        for (handler, ctx) in selected {
            let outcome = run_handler(&handler, ctx, defaults).await;
            results.push((handler, outcome));
        }
        results
    }
}

/// The handler state after `outcome`, at loop time `now`.
pub fn apply_outcome(
    state: &HandlerState,
    outcome: &Outcome,
    handler: &HandlerDescriptor,
    defaults: &ExecutionSettings,
    now: f64,
) -> HandlerState {
    let mut next = state.clone();
    next.attempts = state.attempts.saturating_add(1);
    next.last_seen = Some(now);

    let (delay, message) = match outcome {
        Outcome::Success(_) => {
            next.status = HandlerStatus::Success;
            next.delayed = None;
            next.message = None;
            return next;
        }
        Outcome::Permanent { message } => {
            next.status = HandlerStatus::Failure;
            next.delayed = None;
            next.message = Some(message.clone());
            return next;
        }
        Outcome::Temporary { delay, message } => (*delay, message.clone()),
        Outcome::Timeout => (None, "handler timed out".to_owned()),
    };

    let retries = handler.retries.or(defaults.default_retries);
    if retries.is_some_and(|limit| next.attempts > limit) {
        debug!(handler = %handler.id, attempts = next.attempts, "retries exhausted");
        next.status = HandlerStatus::Failure;
        next.delayed = None;
        next.message = Some(format!("{message} (retries exhausted)"));
        return next;
    }

    let delay = delay.unwrap_or_else(|| {
        handler
            .backoff
            .as_ref()
            .unwrap_or(&defaults.default_backoff)
            .delay(next.attempts)
    });
    next.status = HandlerStatus::AwaitingRetry;
    next.delayed = Some(now + delay.as_secs_f64());
    next.message = Some(message);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Reason;
    use crate::handler::handler_fn;

    fn handler() -> HandlerDescriptor {
        HandlerDescriptor::on_create("h", handler_fn(|_| async { Ok(None) }))
    }

    fn temporary(delay: Option<u64>) -> Outcome {
        Outcome::Temporary {
            delay: delay.map(Duration::from_secs),
            message: "not yet".into(),
        }
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(30), Duration::from_secs(60));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn backoff_deserializes_from_tagged_config() {
        let backoff: Backoff =
            serde_json::from_value(serde_json::json!({"type": "fixed", "delay": 1.5})).unwrap();
        assert_eq!(backoff.delay(7), Duration::from_millis(1500));
    }

    #[test]
    fn temporary_with_delay_schedules_retry() {
        let state = HandlerState::pending(0.0, Reason::Create);
        let next = apply_outcome(&state, &temporary(Some(5)), &handler(), &Default::default(), 10.0);
        assert_eq!(next.status, HandlerStatus::AwaitingRetry);
        assert_eq!(next.attempts, 1);
        assert_eq!(next.delayed, Some(15.0));
        assert_eq!(next.last_seen, Some(10.0));
    }

    #[test]
    fn temporary_without_delay_uses_backoff() {
        let handler = handler().backoff(Backoff::Fixed {
            delay: Duration::from_secs(3),
        });
        let state = HandlerState::pending(0.0, Reason::Create);
        let next = apply_outcome(&state, &temporary(None), &handler, &Default::default(), 1.0);
        assert_eq!(next.delayed, Some(4.0));
    }

    #[test]
    fn exceeding_retries_escalates_to_failure() {
        let handler = handler().retries(2);
        let defaults = ExecutionSettings::default();
        let mut state = HandlerState::pending(0.0, Reason::Create);
        for _ in 0..3 {
            assert!(!state.is_finished());
            state = apply_outcome(&state, &temporary(Some(1)), &handler, &defaults, 0.0);
        }
        assert_eq!(state.status, HandlerStatus::Failure);
        assert_eq!(state.attempts, 3);
        assert!(state.message.unwrap().contains("retries exhausted"));
    }

    #[test]
    fn success_and_permanent_are_final() {
        let state = HandlerState::pending(0.0, Reason::Create);
        let ok = apply_outcome(&state, &Outcome::Success(None), &handler(), &Default::default(), 0.0);
        assert_eq!(ok.status, HandlerStatus::Success);
        let failed = apply_outcome(
            &state,
            &Outcome::Permanent { message: "bad".into() },
            &handler(),
            &Default::default(),
            0.0,
        );
        assert_eq!(failed.status, HandlerStatus::Failure);
        assert_eq!(failed.message.as_deref(), Some("bad"));
    }

    #[test]
    fn unexpected_errors_become_temporary() {
        let outcome = Outcome::from_result(Err(anyhow::anyhow!("boom").into()));
        assert!(matches!(outcome, Outcome::Temporary { delay: None, .. }));
    }
}
