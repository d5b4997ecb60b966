//! Periodic background sweeps.

use super::JobOrchestrator;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

impl JobOrchestrator {
    /// Start the lock, checkpoint, and job-retention sweeps.
    ///
    /// Each runs on its own interval until `shutdown` flips to `true`.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let lock_sweep = {
            let orchestrator = self.clone();
            spawn_periodic("lock sweep", self.settings.lock_sweep, shutdown.clone(), move || {
                let orchestrator = orchestrator.clone();
                async move {
                    let removed = orchestrator.locks.cleanup_expired();
                    if removed > 0 {
                        tracing::info!(removed, "expired locks released");
                    }
                }
            })
        };

        let checkpoint_sweep = {
            let orchestrator = self.clone();
            spawn_periodic(
                "checkpoint sweep",
                self.settings.checkpoint_sweep,
                shutdown.clone(),
                move || {
                    let orchestrator = orchestrator.clone();
                    async move {
                        let max_age = orchestrator.settings.checkpoint_max_age_hours;
                        if let Err(error) = orchestrator.checkpoints.cleanup_expired(max_age).await {
                            tracing::warn!(%error, "checkpoint sweep failed");
                        }
                    }
                },
            )
        };

        let retention_sweep = {
            let orchestrator = self.clone();
            spawn_periodic(
                "retention sweep",
                self.settings.retention_sweep,
                shutdown,
                move || {
                    let orchestrator = orchestrator.clone();
                    async move {
                        if let Err(error) = orchestrator.cleanup_old_jobs().await {
                            tracing::warn!(%error, "job retention sweep failed");
                        }
                    }
                },
            )
        };

        vec![lock_sweep, checkpoint_sweep, retention_sweep]
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut work: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        if *shutdown.borrow() {
            return;
        }
        tracing::debug!(task = name, period_secs = period.as_secs(), "maintenance task started");

        loop {
            let stop = tokio::select! {
                _ = interval.tick() => false,
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            };
            if stop {
                break;
            }
            work().await;
        }

        tracing::debug!(task = name, "maintenance task stopped");
    })
}
