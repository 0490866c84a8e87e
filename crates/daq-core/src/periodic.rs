//! Cancellable periodic background tasks.
//!
//! Instrument controllers refresh their cached status on a fixed cadence. A
//! [`PeriodicTask`] owns one such loop: a `tokio::time::interval` raced against
//! a [`CancelToken`] inside `select!`. Shutting the task down cancels the token
//! and awaits the loop, so after `shutdown().await` returns no further tick
//! runs. Dropping the task cancels it without waiting.
//!
//! The same [`CancelToken`] type is used for cooperative cancellation of long
//! sweeps.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Cooperative cancellation flag shared between a requester and a worker.
///
/// Clones observe the same flag. Cancellation is sticky.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// A background loop that runs `tick` every `period` until cancelled.
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn the loop. The first tick runs immediately.
    ///
    /// Ticks that overrun the period are delayed rather than bursted.
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancelToken::new();
        let task_token = token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("'{}' polling task started every {:?}", task_name, period);

            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => {
                        debug!("'{}' polling task shutting down", task_name);
                        break;
                    }
                    _ = interval.tick() => tick().await,
                }
            }
        });

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    /// Task name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the loop and wait for it to exit.
    ///
    /// A tick that is already running is allowed to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("'{}' polling task ended abnormally: {}", self.name, e);
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_until_shutdown() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = PeriodicTask::spawn("counter", Duration::from_secs(2), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Ticks at t = 0, 2, 4, 6
        tokio::time::sleep(Duration::from_millis(6_500)).await;
        task.shutdown().await;
        let after_shutdown = count.load(Ordering::SeqCst);
        assert_eq!(after_shutdown, 4);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_the_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = PeriodicTask::spawn("dropped", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(task);

        let before = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn cancel_token_is_shared_and_sticky() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(!worker.is_cancelled());

        token.cancel();
        worker.cancelled().await;
        assert!(worker.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
