//! Owned periodic background tasks.

use log::{debug, info};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// A recurring task bound to the lifetime of the service that owns it.
///
/// The loop only holds a weak reference to its target, so dropping the service
/// ends the loop on its next tick. Dropping the handle aborts the task outright.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `tick` every `period`, starting one period from now.
    pub fn spawn_periodic<T, F, Fut>(
        name: &'static str,
        period: Duration,
        target: Weak<T>,
        tick: F,
    ) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        info!("Starting background task '{}' every {:?}", name, period);

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(target) = target.upgrade() else {
                    debug!("Background task '{}' lost its owner, exiting", name);
                    break;
                };
                tick(target).await;
            }
        });

        Self {
            name,
            handle: Some(handle),
        }
    }

    /// Whether the task is still scheduled.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the task. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!("Stopping background task '{}'", self.name);
            handle.abort();
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_until_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut task = BackgroundTask::spawn_periodic(
            "counter",
            Duration::from_secs(60),
            Arc::downgrade(&counter),
            |c| async move {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        time::sleep(Duration::from_secs(185)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        task.shutdown();
        assert!(!task.is_running());
        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exits_when_owner_dropped() {
        let owner = Arc::new(AtomicUsize::new(0));
        let task = BackgroundTask::spawn_periodic(
            "orphan",
            Duration::from_secs(1),
            Arc::downgrade(&owner),
            |_| async {},
        );
        drop(owner);
        time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(!task.is_running());
    }
}
