//! Background task that runs a job on a fixed interval until cancelled.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Handle to a running periodic job
pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `job` every `period`. The first run happens one period after spawn.
    ///
    /// A zero period never runs the job; the returned task is already
    /// finishing.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if period.is_zero() {
                tracing::error!(task = name, "Periodic task needs a non-zero period, not starting");
                return;
            }
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // job returns false once its owner is gone
                if !job().await {
                    tracing::debug!(task = name, "Periodic task owner dropped, exiting");
                    break;
                }
            }
        });

        Self { name, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort the task and wait for it; cancellation is not an error
    pub async fn cancel(self) {
        self.handle.abort();
        match self.handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                tracing::debug!(task = self.name, "Periodic task cancelled");
            }
            Err(e) => {
                tracing::error!(task = self.name, error = %e, "Periodic task failed");
            }
        }
    }
}
