//! Shared timed executor for the session's background work.
//!
//! Token refresh, auto-restart and the keep-alive all run through one
//! [`Scheduler`] so the session can cancel everything at close and no
//! component spawns tasks of its own.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Handle to the session's background task pool.
///
/// Every scheduled task gets a child [`CancellationToken`] so it can be
/// cancelled individually; [`Scheduler::shutdown`] cancels them all and
/// waits for the pool to drain.
#[derive(Debug, Clone)]
pub struct Scheduler {
    tracker: TaskTracker,
    root: CancellationToken,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            root: CancellationToken::new(),
        }
    }

    /// Runs `task` once after `delay` unless cancelled first.
    pub fn schedule_once<F, Fut>(&self, delay: Duration, task: F) -> CancellationToken
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let token = self.root.child_token();
        let guard = token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => task().await,
            }
        });
        token
    }

    /// Runs `task` every `period` (first run one period from now) until
    /// cancelled.
    pub fn schedule_repeating<F, Fut>(&self, period: Duration, mut task: F) -> CancellationToken
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let token = self.root.child_token();
        let guard = token.clone();
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // first tick triggers instantly
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = guard.cancelled() => break,
                    _ = interval.tick() => task().await,
                }
            }
        });
        token
    }

    /// Cancels every scheduled task and waits for the pool to drain.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn cancelled_task_never_fires() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let token = scheduler.schedule_once(Duration::from_millis(20), {
            let fired = Arc::clone(&fired);
            move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        token.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeating_task_fires_until_cancelled() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let token = scheduler.schedule_repeating(Duration::from_millis(10), {
            let fired = Arc::clone(&fired);
            move || {
                let fired = Arc::clone(&fired);
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(55)).await;
        token.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let seen = fired.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected repeated firings, saw {seen}");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        scheduler.schedule_once(Duration::from_secs(60), {
            let fired = Arc::clone(&fired);
            move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        scheduler.shutdown().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
