//! Recurring task primitives shared by every periodic sensor.
//!
//! All periodic work goes through `tokio::time::interval`, so a paused test
//! clock drives it deterministically.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::debug;

/// Interval whose first tick fires one `period` from now instead of immediately.
/// Late ticks are delayed, never bunched.
pub fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.reset();
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Handle to a spawned recurring task. Dropping it cancels the task.
pub struct Recurring {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl Recurring {
    /// Run `job` every `period`, starting immediately when `run_now` is set.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, run_now: bool, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if run_now {
                job().await;
            }
            let mut ticker = ticker(period);
            loop {
                ticker.tick().await;
                job().await;
            }
        });
        debug!(task = name, period_ms = period.as_millis() as u64, "recurring task started");
        Self { name, handle }
    }
}

impl Drop for Recurring {
    fn drop(&mut self) {
        self.handle.abort();
        debug!(task = self.name, "recurring task cancelled");
    }
}
