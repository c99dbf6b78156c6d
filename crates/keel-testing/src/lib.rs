//! Testing utilities for keel reactors.
//!
//! - [`fixtures`]: entity bodies, identities and fast settings
//! - [`HandlerRecorder`]: handlers that record their calls and fail on demand
//! - [`wait_until`]: poll a condition, for tests on a paused clock

pub mod fixtures;
mod recorder;

use std::time::Duration;

pub use recorder::{HandlerRecorder, Invocation, RecordingHandler};

/// Poll `condition` every 10ms until it holds or `limit` passes.
///
/// Returns whether the condition held. With a paused tokio clock the polling
/// costs no real time.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
