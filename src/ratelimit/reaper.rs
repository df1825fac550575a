//! Background task that fires eviction timers as they come due.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::limiter::Limiter;

/// Owns a running reaper task. Dropping the handle stops the task.
#[derive(Debug)]
pub struct ReaperHandle {
    task: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            info!("Eviction reaper stopped");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub(crate) fn spawn(limiter: &Arc<Limiter>) -> ReaperHandle {
    let wakeup = limiter.wakeup();
    let limiter = Arc::downgrade(limiter);
    let task = tokio::spawn(run(limiter, wakeup));
    info!("Eviction reaper started");
    ReaperHandle { task: Some(task) }
}

/// Fire due timers, then sleep until the next deadline or until an earlier
/// timer is armed. Exits once the limiter is dropped: `Limiter`'s `Drop`
/// signals `wakeup`, so an idle reaper wakes and finds the `Weak` dead.
async fn run(limiter: Weak<Limiter>, wakeup: Arc<Notify>) {
    loop {
        let delay = {
            let Some(limiter) = limiter.upgrade() else {
                break;
            };
            let fired = limiter.fire_due_timers();
            if fired > 0 {
                trace!(fired, "Fired eviction timers");
            }
            limiter
                .next_deadline()
                .map(|at| Duration::from_millis(at.saturating_sub(limiter.now_millis())))
        };

        match delay {
            Some(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wakeup.notified() => {}
                }
            }
            None => wakeup.notified().await,
        }
    }
    debug!("Limiter dropped, reaper exiting");
}
