//! Periodic job producers.
//!
//! The worker never releases or sweeps on a timer directly. Timers only
//! enqueue editions-queue jobs with dedup keys, so several worker processes
//! ticking at once still produce one job.

use editions_core::environment::Clock;
use editions_core::queue::{JobHandle, JobQueue, QueueError};
use editions_pipeline::edition_jobs;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Run `tick` every `every` until shutdown. The first tick fires immediately.
pub async fn run_timer<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<JobHandle, QueueError>>,
{
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(timer = name, every_secs = every.as_secs(), "Timer started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!(timer = name, "Timer stopped");
                break;
            }
            _ = interval.tick() => {
                match tick().await {
                    Ok(handle) => debug!(
                        timer = name,
                        job_id = %handle.id,
                        deduplicated = handle.deduplicated,
                        "Timer scheduled job"
                    ),
                    Err(e) => warn!(timer = name, error = %e, "Timer failed to schedule job"),
                }
            }
        }
    }
}

/// Spawn the daily release check.
pub fn spawn_release_timer(
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    every: Duration,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(run_timer("release-next", every, shutdown, move || {
        let queue = Arc::clone(&queue);
        let today = clock.today();
        async move { edition_jobs::schedule_release_next(queue.as_ref(), today).await }
    }))
}

/// Spawn the access expiry sweep.
pub fn spawn_expiry_timer(
    queue: Arc<dyn JobQueue>,
    every: Duration,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(run_timer("expire-sweep", every, shutdown, move || {
        let queue = Arc::clone(&queue);
        async move { edition_jobs::schedule_expiry_sweep(queue.as_ref()).await }
    }))
}
