//! Poll-based repeating calls.
//!
//! [`repeat`] wakes every `poll` and runs the action once at least `cadence`
//! has passed since the previous run. Cadence is a minimum spacing; actual
//! spacing can exceed it by up to one poll interval.

use std::future::Future;
use std::time::Duration;

use tokio::time::{self, Instant};

/// Default wake-up granularity.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Default heartbeat cadence.
pub const DEFAULT_HEARTBEAT_CADENCE: Duration = Duration::from_secs(59);

/// Run `action` forever, no more often than every `cadence`.
///
/// The action is awaited to completion before the next poll. The first run
/// happens one cadence after the loop starts. Only returns when the action
/// fails; otherwise it runs until the surrounding task is cancelled.
pub async fn repeat<F, Fut, E>(mut action: F, cadence: Duration, poll: Duration) -> Result<(), E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let mut last_called = Instant::now();

    loop {
        let now = Instant::now();
        if now.duration_since(last_called) >= cadence {
            action().await?;
            last_called = now;
        }

        time::sleep(poll).await;
    }
}
