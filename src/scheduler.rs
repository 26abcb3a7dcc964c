use crate::task_queue::{Task, TaskQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Enqueues a scan of incomplete addresses on a fixed interval.
///
/// Ticks do not wait for earlier scans to finish, so scan cycles may overlap.
pub struct PeriodicScheduler {
    period: Duration,
}

impl PeriodicScheduler {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    /// Spawns the timer loop. The first scan fires one full period after start.
    ///
    /// The loop exits when `shutdown` flips to true or its sender is dropped.
    pub fn spawn(
        self,
        queue: Arc<dyn TaskQueue>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!("✓ Periodic scan scheduled every {:?}", self.period);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match queue.enqueue(Task::ScanIncompleteAddresses) {
                            Ok(handle) => tracing::debug!(task_id = %handle.0, "Scheduled scan enqueued"),
                            Err(e) => tracing::error!("Failed to enqueue scheduled scan: {}", e),
                        }
                    }
                }
            }

            tracing::info!("Periodic scheduler stopped");
        })
    }
}
