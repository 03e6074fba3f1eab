//! Background scheduler sweep.
//!
//! A scheduler is expected to unregister itself when it finishes, when its
//! stop predicate fires, or when shutdown tears it down. One that was
//! terminated from outside never does; the heartbeat loop finds those and
//! unregisters them so the scheduler set does not grow without bound.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::Runtime;

/// Statistics from one sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepStats {
    /// Schedulers looked at
    pub examined: usize,
    /// Terminated schedulers unregistered by the sweep
    pub removed: usize,
    /// When the sweep completed
    pub completed_at: Option<DateTime<Utc>>,
}

impl Runtime {
    /// Start the heartbeat loop. It holds only a weak reference and stops
    /// when the runtime begins teardown or is dropped.
    pub(crate) fn spawn_scheduler_sweep(&self) {
        let runtime = Arc::downgrade(&self.inner);
        let stop = self.inner.lifecycle.clone();
        let period = self.inner.config.scheduler_heartbeat;

        self.inner.pool.handle().spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = runtime.upgrade() else {
                            break;
                        };
                        let stats = Runtime::from_inner(inner).sweep_schedulers();
                        if stats.removed > 0 {
                            tracing::info!(
                                removed = stats.removed,
                                examined = stats.examined,
                                "scheduler_sweep_removed_terminated"
                            );
                        }
                    }
                    _ = stop.cancelled() => {
                        tracing::debug!("scheduler_sweep_stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Run one sweep now: unregister every scheduler found terminated
    /// without having unregistered.
    pub fn sweep_schedulers(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let ctx = self.inner.root.child("sweep");

        for scheduler in self.inner.schedulers.snapshot() {
            stats.examined += 1;
            if scheduler.is_unregistered() {
                // Unregistered but still present: an interceptor swallowed
                // the event. Drop it directly.
                if self.inner.schedulers.remove(scheduler.id()) {
                    stats.removed += 1;
                }
                continue;
            }
            if scheduler.is_terminated() && self.unregister_scheduler(&ctx, &scheduler) {
                tracing::debug!(scheduler = %scheduler.id(), "scheduler_swept");
                stats.removed += 1;
            }
        }

        stats.completed_at = Some(Utc::now());
        stats
    }
}
