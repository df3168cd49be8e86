use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Cancellation signal shared by every task of one scheduler.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        if *receiver.borrow() {
            return;
        }
        while receiver.changed().await.is_ok() {
            if *receiver.borrow() {
                return;
            }
        }
    }
}

/// Periodic tasks owned by one payment session.
///
/// `stop` is unconditional: it signals the token and aborts every handle,
/// so no task outlives it regardless of where it is suspended.
pub struct TaskScheduler {
    token: CancelToken,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self {
            token: CancelToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Runs `task` every `period`, first after one full period. The task
    /// ends itself by returning `ControlFlow::Break`.
    pub fn every<F, Fut>(&self, name: &'static str, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        if self.token.is_cancelled() {
            debug!(task = name, "scheduler already stopped; not starting task");
            return;
        }

        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        if token.is_cancelled() || task().await.is_break() {
                            break;
                        }
                    }
                }
            }
            debug!(task = name, "scheduled task finished");
        });

        if let Ok(mut handles) = self.handles.lock() {
            handles.retain(|(_, h)| !h.is_finished());
            handles.push((name, handle));
        }
    }

    /// Number of tasks still running.
    pub fn active(&self) -> usize {
        self.handles
            .lock()
            .map(|handles| handles.iter().filter(|(_, h)| !h.is_finished()).count())
            .unwrap_or(0)
    }

    pub fn stop(&self) {
        self.token.cancel();
        let drained: Vec<_> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for (name, handle) in drained {
            handle.abort();
            debug!(task = name, "scheduled task cancelled");
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn runs_periodically_until_stopped() {
        let scheduler = TaskScheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        scheduler.every("count", Duration::from_secs(1), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { ControlFlow::Continue(()) }
        });
        assert_eq!(scheduler.active(), 1);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        scheduler.stop();
        assert_eq!(scheduler.active(), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn task_can_end_itself() {
        let scheduler = TaskScheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        scheduler.every("twice", Duration::from_secs(5), move || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n >= 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_scheduler_refuses_new_tasks() {
        let scheduler = TaskScheduler::new();
        scheduler.stop();
        scheduler.every("late", Duration::from_secs(1), || async { ControlFlow::Continue(()) });
        assert_eq!(scheduler.active(), 0);
    }

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }
}
