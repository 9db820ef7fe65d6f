//! Scheduler (poller) - turns due monitors into probe tasks
//!
//! Every tick asks the store for due monitors and enqueues one probe task
//! per monitor. The scheduler never probes anything itself; that separation
//! lets executor replicas scale independently. It keeps no state of its
//! own, so duplicate schedulers at worst cause duplicate probes, which the
//! append-only observation log tolerates.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use crate::queue::TaskQueue;
use crate::store::CatalogStore;
use crate::types::ProbeTask;

/// Scheduler tick period.
pub const TICK_PERIOD: Duration = Duration::from_secs(10);

pub struct Poller {
    store: Arc<dyn CatalogStore>,
    queue: Arc<dyn TaskQueue>,
    tick_period: Duration,
}

impl Poller {
    pub fn new(store: Arc<dyn CatalogStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            store,
            queue,
            tick_period: TICK_PERIOD,
        }
    }

    /// Override the tick period (tests).
    pub fn with_tick_period(mut self, tick_period: Duration) -> Self {
        self.tick_period = tick_period;
        self
    }

    /// Run the tick loop until cancelled. No task is enqueued after this
    /// returns.
    #[instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) {
        debug!("scheduler started (tick every {:?})", self.tick_period);

        let mut ticker = interval(self.tick_period);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    self.enqueue_due_monitors().await;
                }
            }
        }

        debug!("scheduler stopped");
    }

    async fn enqueue_due_monitors(&self) {
        let monitors = match self.store.get_due_monitors().await {
            Ok(monitors) => monitors,
            Err(e) => {
                error!("failed to fetch due monitors: {e}");
                return;
            }
        };

        if monitors.is_empty() {
            return;
        }

        debug!("{} monitors due, enqueueing probes", monitors.len());

        for monitor in monitors {
            let task = ProbeTask {
                monitor_id: monitor.id,
                url: monitor.url,
            };

            match self.queue.enqueue(&task).await {
                Ok(()) => trace!("enqueued probe for {} ({})", task.monitor_id, task.url),
                // The monitor stays due; the next tick retries.
                Err(e) => warn!("failed to enqueue probe for {}: {e}", task.monitor_id),
            }
        }
    }
}
