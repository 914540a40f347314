//! Background work that must never fail the request that spawned it.
//!
//! Tasks run detached on the tokio runtime. Errors are logged and counted;
//! tests call [`TaskQueue::wait_idle`] to observe completion.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;

#[derive(Default)]
pub struct TaskQueue {
    inflight: Mutex<JoinSet<()>>,
    failures: Arc<AtomicU64>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` in the background. An `Err` is logged under `name`.
    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let failures = Arc::clone(&self.failures);
        let mut inflight = self.inflight.lock();
        // Reap finished tasks so the set does not grow without bound.
        while inflight.try_join_next().is_some() {}
        inflight.spawn(async move {
            if let Err(e) = fut.await {
                failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(task = name, "Background task failed: {e:#}");
            }
        });
    }

    /// Number of tasks that returned an error so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Wait until every task spawned so far has finished, including tasks
    /// they spawn in turn.
    pub async fn wait_idle(&self) {
        loop {
            let mut batch = std::mem::take(&mut *self.inflight.lock());
            if batch.is_empty() {
                return;
            }
            while let Some(res) = batch.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!("Background task panicked: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn errors_are_counted_not_propagated() {
        let queue = TaskQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            let ran = ran.clone();
            queue.spawn("test", async move {
                ran.fetch_add(1, Ordering::SeqCst);
                if i % 2 == 0 {
                    anyhow::bail!("task {i} failed");
                }
                Ok(())
            });
        }
        queue.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert_eq!(queue.failures(), 2);
    }

    #[tokio::test]
    async fn wait_idle_on_empty_queue_returns() {
        let queue = TaskQueue::new();
        queue.wait_idle().await;
        assert_eq!(queue.failures(), 0);
    }
}
