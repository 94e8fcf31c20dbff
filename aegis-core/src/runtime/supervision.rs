//! Restart supervision for the runtime's background tasks.
//!
//! Every long-lived loop (dispatch, heartbeat, leader watch) runs under
//! [`spawn_supervised`]: an uncaught error logs, bumps a counter, and the
//! task restarts with exponential backoff instead of silently dying.

// Layer 1: Standard library imports
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

// Layer 3: Internal module imports
use crate::error::Result;
use crate::metrics::{counters, Metrics};

/// Exponential backoff between restarts of one supervised task.
///
/// ```text
/// delay = base_delay * 2^(min(restart_count, 10))
/// delay = min(delay, max_delay)
/// ```
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    base_delay: Duration,
    max_delay: Duration,
    restarts: u32,
}

impl RestartBackoff {
    /// Create a backoff tracker.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            restarts: 0,
        }
    }

    /// Record a restart and return the delay to wait before it.
    pub fn record_restart(&mut self) -> Duration {
        let exponent = self.restarts.min(10);
        self.restarts = self.restarts.saturating_add(1);
        let delay = self.base_delay * (1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Restarts recorded so far.
    pub fn restart_count(&self) -> u32 {
        self.restarts
    }

    /// Forget the history after a long stable run.
    pub fn reset(&mut self) {
        self.restarts = 0;
    }
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

/// Run `factory`-produced task bodies until one finishes cleanly or
/// shutdown is signalled; error exits restart with backoff.
pub(crate) fn spawn_supervised<F, Fut>(
    name: &'static str,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = RestartBackoff::default();
        loop {
            if *shutdown.borrow() {
                return;
            }
            let body = factory();
            let result = tokio::select! {
                result = body => result,
                _ = shutdown.changed() => return,
            };
            match result {
                Ok(()) => return,
                Err(err) => {
                    metrics.incr(counters::TASK_RESTARTS);
                    let delay = backoff.record_restart();
                    warn!(task = name, %err, ?delay, "supervised task failed, restarting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::AegisError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let mut backoff = RestartBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        assert_eq!(backoff.record_restart(), Duration::from_millis(100));
        assert_eq!(backoff.record_restart(), Duration::from_millis(200));
        assert_eq!(backoff.record_restart(), Duration::from_millis(400));
        for _ in 0..10 {
            backoff.record_restart();
        }
        assert_eq!(backoff.record_restart(), Duration::from_secs(5));
    }

    #[test]
    fn reset_clears_history() {
        let mut backoff = RestartBackoff::default();
        backoff.record_restart();
        backoff.record_restart();
        backoff.reset();
        assert_eq!(backoff.restart_count(), 0);
        assert_eq!(backoff.record_restart(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn supervised_task_restarts_until_success() {
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = watch::channel(false);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let handle = spawn_supervised("test", Arc::clone(&metrics), rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AegisError::transport("boom"))
                } else {
                    Ok(())
                }
            }
        });

        handle.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.counter(counters::TASK_RESTARTS), 2);
        drop(tx);
    }

    #[tokio::test]
    async fn supervised_task_stops_on_shutdown() {
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = watch::channel(false);

        let handle = spawn_supervised("forever", metrics, rx, move || async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
