use std::{future::Future, sync::Arc};

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Supervised home for work that runs after the response has been handed
/// back: persistence, lead extraction, CRM delivery.
///
/// Tasks are tracked so shutdown and tests can wait for them. Store access is
/// bounded through [`BackgroundQueue::limited`]; a task waiting on another
/// task's result holds no permit while it waits.
#[derive(Clone)]
pub struct BackgroundQueue {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
}

impl BackgroundQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn spawn<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker
            .spawn(task.instrument(tracing::debug_span!("background", task = label)));
    }

    pub async fn limited<F: Future>(&self, work: F) -> F::Output {
        // The semaphore is never closed, so acquire only fails in theory.
        let _permit = self.permits.acquire().await.ok();
        work.await
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Waits until every task spawned so far, and anything those tasks spawn,
    /// has finished. The queue keeps accepting work afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn drain_waits_for_nested_tasks() {
        let queue = BackgroundQueue::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        let outer_queue = queue.clone();
        let outer_done = done.clone();
        queue.spawn("outer", async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            outer_done.fetch_add(1, Ordering::SeqCst);
            let inner_done = outer_done.clone();
            outer_queue.spawn("inner", async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                inner_done.fetch_add(1, Ordering::SeqCst);
            });
        });

        queue.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn limited_caps_concurrency() {
        let queue = BackgroundQueue::new(1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let queue_ref = queue.clone();
            let active = active.clone();
            let peak = peak.clone();
            queue.spawn("work", async move {
                queue_ref
                    .limited(async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            });
        }

        queue.drain().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
