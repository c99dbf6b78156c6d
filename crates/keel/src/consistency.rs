//! The consistency gate: wait until the observed state can be trusted.
//!
//! After the reactor patches an object, the notifications that follow may
//! still describe the state from before the patch. The worker records a
//! consistency time; until it passes, change detection would compare against
//! stale data. The gate sleeps until then, but gives up early when a newer
//! notification arrives (stream pressure) or the reactor shuts down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::time::Clock;

/// A level-triggered, shareable signal.
#[derive(Debug, Clone)]
pub struct Flag(Arc<watch::Sender<bool>>);

impl Flag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub fn raise(&self) {
        self.0.send_replace(true);
    }

    pub fn clear(&self) {
        self.0.send_replace(false);
    }

    pub fn is_raised(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the flag is raised; immediately if it already is.
    pub async fn raised(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

/// How the gate let the cycle through.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateOutcome {
    /// No waiting was needed.
    Immediate,
    /// Slept for `delay` seconds.
    Slept { delay: f64 },
    /// A newer notification arrived; skip change detection for this one.
    Interrupted,
    /// The reactor is stopping.
    ShutDown,
}

impl GateOutcome {
    /// Whether the cycle may proceed to change detection.
    pub fn proceeds(&self) -> bool {
        matches!(self, Self::Immediate | Self::Slept { .. })
    }
}

/// Seconds until `consistency_time`; `None` when there is none.
///
/// Zero or negative means the time has already come.
pub fn consistency_delay(consistency_time: Option<f64>, now: f64) -> Option<f64> {
    consistency_time.map(|t| t - now)
}

/// Sleep until `consistency_time`, at most `limit`, unless interrupted.
pub async fn wait_for_consistency(
    clock: &Clock,
    consistency_time: Option<f64>,
    limit: Duration,
    pressure: &Flag,
    shutdown: &Flag,
) -> GateOutcome {
    let delay = match consistency_delay(consistency_time, clock.now()) {
        Some(delay) if delay > 0.0 => delay.min(limit.as_secs_f64()),
        _ => return GateOutcome::Immediate,
    };

    debug!(delay, "waiting for consistency");
    tokio::select! {
        biased;
        _ = shutdown.raised() => GateOutcome::ShutDown,
        _ = pressure.raised() => {
            debug!("consistency wait interrupted by a newer notification");
            GateOutcome::Interrupted
        }
        _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => GateOutcome::Slept { delay },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn no_consistency_time_is_immediate() {
        let clock = Clock::new();
        let outcome = wait_for_consistency(&clock, None, LIMIT, &Flag::new(), &Flag::new()).await;
        assert_eq!(outcome, GateOutcome::Immediate);
        assert_eq!(clock.now(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn past_and_equal_times_are_immediate() {
        let clock = Clock::new();
        tokio::time::advance(Duration::from_secs(10)).await;
        let now = clock.now();

        let past = wait_for_consistency(&clock, Some(now - 3.0), LIMIT, &Flag::new(), &Flag::new()).await;
        assert_eq!(past, GateOutcome::Immediate);

        let equal = wait_for_consistency(&clock, Some(now), LIMIT, &Flag::new(), &Flag::new()).await;
        assert_eq!(equal, GateOutcome::Immediate);
        assert_eq!(clock.now(), now);
    }

    #[tokio::test(start_paused = true)]
    async fn future_time_sleeps_until_then() {
        let clock = Clock::new();
        let outcome = wait_for_consistency(&clock, Some(3.0), LIMIT, &Flag::new(), &Flag::new()).await;
        assert_eq!(outcome, GateOutcome::Slept { delay: 3.0 });
        assert!(clock.now() >= 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_capped_by_limit() {
        let clock = Clock::new();
        let outcome = wait_for_consistency(&clock, Some(100.0), LIMIT, &Flag::new(), &Flag::new()).await;
        assert_eq!(outcome, GateOutcome::Slept { delay: 5.0 });
        assert!(clock.now() < 6.0);
    }

    #[tokio::test(start_paused = true)]
    async fn pressure_interrupts_the_wait() {
        let clock = Clock::new();
        let pressure = Flag::new();
        let raiser = pressure.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            raiser.raise();
        });

        let outcome = wait_for_consistency(&clock, Some(4.0), LIMIT, &pressure, &Flag::new()).await;
        assert_eq!(outcome, GateOutcome::Interrupted);
        assert!(clock.now() < 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_wins_over_everything() {
        let clock = Clock::new();
        let pressure = Flag::new();
        let shutdown = Flag::new();
        pressure.raise();
        shutdown.raise();
        let outcome = wait_for_consistency(&clock, Some(4.0), LIMIT, &pressure, &shutdown).await;
        assert_eq!(outcome, GateOutcome::ShutDown);
    }

    #[test]
    fn delay_arithmetic() {
        assert_eq!(consistency_delay(None, 10.0), None);
        assert_eq!(consistency_delay(Some(12.5), 10.0), Some(2.5));
        assert_eq!(consistency_delay(Some(10.0), 10.0), Some(0.0));
    }
}
