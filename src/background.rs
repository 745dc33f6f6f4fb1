//! Owned handles for recurring background work.
//!
//! Token refresh and cache sweeps run as tokio tasks owned by a
//! [`BackgroundTask`]. Dropping the handle aborts the task, so nothing
//! outlives the component that started it.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Longest delay a timer is armed for. Longer durations are clamped to it.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + after`, with `after` clamped so the clock cannot overflow.
pub(crate) fn deadline_after(from: Instant, after: Duration) -> Instant {
    from + after.min(FAR_FUTURE)
}

/// Handle to a recurring task. Aborts the task on drop.
#[must_use = "dropping a BackgroundTask stops it"]
pub struct BackgroundTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Run `tick` every `period`, starting one period from now.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context, and `period` must be non-zero.
    pub(crate) fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.min(FAR_FUTURE);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                debug!(task = name, "background tick");
                tick().await;
            }
        });
        Self { name, handle }
    }

    /// Task name, for logging.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task has stopped (it only stops when cancelled or on panic).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the task now.
    pub fn cancel(self) {
        // Drop does the abort.
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl std::fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("name", &self.name)
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}
