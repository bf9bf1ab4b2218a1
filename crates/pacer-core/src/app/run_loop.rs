//! RunLoop - background ticker driving a `Scheduler`.
//!
//! Sleeps until the next regular tick or the earliest fixed-minute fire time,
//! whichever comes first, then ticks. Shutdown is a `watch` flag raced
//! against the sleep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::scheduler::Scheduler;

/// Handle to a running loop.
/// - `request_shutdown()` stops further ticks
/// - `shutdown_and_join()` also waits for in-flight executions
pub struct SchedulerHandle {
    scheduler: Arc<Scheduler>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Spawns the loop. The scheduler should already be started.
    pub fn spawn(scheduler: Arc<Scheduler>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let s = Arc::clone(&scheduler);
        let join = tokio::spawn(async move {
            run_loop(s, &mut shutdown_rx).await;
        });
        Self {
            scheduler,
            shutdown_tx,
            join,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn request_shutdown(&self) {
        // receiver が先に落ちていても無視してよい
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops ticking, then stops the scheduler and waits for in-flight work.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            error!(error = %e, "run loop task failed");
        }
        self.scheduler.shutdown().await;
    }
}

/// Time until the next wake-up: the tick interval, shortened to the earliest
/// fire time when that comes first.
fn next_wait(scheduler: &Scheduler) -> Duration {
    let tick = scheduler.tick_interval();
    match scheduler.next_fire_time() {
        Some(at) => {
            let until = (at - scheduler.now()).to_std().unwrap_or(Duration::ZERO);
            tick.min(until)
        }
        None => tick,
    }
}

async fn run_loop(scheduler: Arc<Scheduler>, shutdown_rx: &mut watch::Receiver<bool>) {
    info!("run loop started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let wait = next_wait(&scheduler);
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender が drop されたら終了
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        match scheduler.tick().await {
            Ok(report) => {
                if !report.dispatched.is_empty() || report.enqueued > 0 {
                    debug!(
                        dispatched = report.dispatched.len(),
                        enqueued = report.enqueued,
                        duplicates = report.duplicates,
                        "tick"
                    );
                }
            }
            Err(e) => error!(error = %e, "tick failed"),
        }
    }
    info!("run loop stopped");
}
