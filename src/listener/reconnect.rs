//! Periodic re-registration of listeners whose failover did not succeed.

use crate::error::{Error, Result};
use crate::metrics::ClientMetrics;
use crate::types::ListenerId;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Result of one reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAttempt {
    /// Stop retrying: the listener was re-registered or given up on.
    Done,
    /// Try again on the next tick.
    Retry,
}

struct ScheduledReconnect {
    generation: u64,
    token: CancellationToken,
}

/// Runs one fixed-rate retry loop per listener id until the attempt reports
/// [`ReconnectAttempt::Done`], the loop is cancelled, or the scheduler shuts
/// down.
pub struct ReconnectScheduler {
    period: Duration,
    shutdown: CancellationToken,
    generation: AtomicU64,
    tasks: Arc<DashMap<ListenerId, ScheduledReconnect>>,
    metrics: Arc<ClientMetrics>,
}

impl ReconnectScheduler {
    pub fn new(period: Duration, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            period,
            shutdown: CancellationToken::new(),
            generation: AtomicU64::new(0),
            tasks: Arc::new(DashMap::new()),
            metrics,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run `attempt` every period, the first run one period from now.
    /// Replaces any loop already scheduled for the same id. The attempt gets
    /// the loop's cancellation token and must not install anything once it
    /// is cancelled.
    ///
    /// Fails with [`Error::SchedulerShutdown`] after [`shutdown`](Self::shutdown).
    pub fn schedule<F, Fut>(&self, listener_id: ListenerId, attempt: F) -> Result<()>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReconnectAttempt> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(Error::SchedulerShutdown);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let previous = self.tasks.insert(
            listener_id.clone(),
            ScheduledReconnect {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        self.metrics.pending_reconnects.set(self.tasks.len() as i64);

        let period = self.period;
        let tasks = self.tasks.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(listener_id = %listener_id, "Listener reconnect cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let outcome = attempt(token.clone()).await;
                        if token.is_cancelled() {
                            tracing::debug!(listener_id = %listener_id, "Listener reconnect cancelled during attempt");
                            break;
                        }
                        if outcome == ReconnectAttempt::Done {
                            break;
                        }
                    }
                }
            }

            tasks.remove_if(&listener_id, |_, scheduled| scheduled.generation == generation);
            metrics.pending_reconnects.set(tasks.len() as i64);
        });

        tracing::debug!(
            period_ms = period.as_millis() as u64,
            "Scheduled listener reconnect"
        );
        Ok(())
    }

    /// Stop retrying for one listener. Returns whether a loop was scheduled.
    pub fn cancel(&self, listener_id: &ListenerId) -> bool {
        match self.tasks.remove(listener_id) {
            Some((_, scheduled)) => {
                scheduled.token.cancel();
                self.metrics.pending_reconnects.set(self.tasks.len() as i64);
                true
            }
            None => false,
        }
    }

    /// Whether a reconnect loop is scheduled for the listener.
    pub fn is_scheduled(&self, listener_id: &ListenerId) -> bool {
        self.tasks.contains_key(listener_id)
    }

    /// Number of scheduled reconnect loops.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every loop and refuse new ones.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(pending = self.tasks.len(), "Shutting down listener reconnects");
        self.shutdown.cancel();
        self.tasks.clear();
        self.metrics.pending_reconnects.set(0);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const PERIOD: Duration = Duration::from_millis(5000);

    fn counting(
        attempts: Arc<AtomicUsize>,
        succeed_on: usize,
    ) -> impl Fn(CancellationToken) -> std::future::Ready<ReconnectAttempt> + Send + Sync + 'static {
        move |_token| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n >= succeed_on {
                ReconnectAttempt::Done
            } else {
                ReconnectAttempt::Retry
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_at_fixed_period_until_done() {
        let scheduler = ReconnectScheduler::new(PERIOD, Arc::new(ClientMetrics::new()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let id = ListenerId::from_static(b"l1");

        scheduler
            .schedule(id.clone(), counting(attempts.clone(), 3))
            .unwrap();
        assert!(scheduler.is_scheduled(&id));

        tokio::time::sleep(Duration::from_millis(4999)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(PERIOD).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        tokio::time::sleep(PERIOD).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!scheduler.is_scheduled(&id));

        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_loop() {
        let scheduler = ReconnectScheduler::new(PERIOD, Arc::new(ClientMetrics::new()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let id = ListenerId::from_static(b"l1");

        scheduler
            .schedule(id.clone(), counting(attempts.clone(), usize::MAX))
            .unwrap();
        tokio::time::sleep(PERIOD + Duration::from_millis(1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        assert!(scheduler.cancel(&id));
        assert!(!scheduler.cancel(&id));
        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_loops() {
        let scheduler = ReconnectScheduler::new(PERIOD, Arc::new(ClientMetrics::new()));
        let attempts = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule(ListenerId::from_static(b"l1"), counting(attempts.clone(), usize::MAX))
            .unwrap();
        scheduler.shutdown();
        assert!(scheduler.is_shutdown());
        assert_eq!(scheduler.pending(), 0);

        let result = scheduler.schedule(ListenerId::from_static(b"l2"), counting(attempts.clone(), 1));
        assert!(matches!(result, Err(Error::SchedulerShutdown)));

        tokio::time::sleep(PERIOD * 2).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous_loop() {
        let scheduler = ReconnectScheduler::new(PERIOD, Arc::new(ClientMetrics::new()));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let id = ListenerId::from_static(b"l1");

        scheduler.schedule(id.clone(), counting(first.clone(), usize::MAX)).unwrap();
        scheduler.schedule(id.clone(), counting(second.clone(), usize::MAX)).unwrap();
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(PERIOD + Duration::from_millis(1)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_attempt_is_visible_to_attempt() {
        let scheduler = Arc::new(ReconnectScheduler::new(PERIOD, Arc::new(ClientMetrics::new())));
        let id = ListenerId::from_static(b"l1");
        let seen_cancelled = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));

        let canceller = scheduler.clone();
        let cancel_id = id.clone();
        let seen = seen_cancelled.clone();
        let counter = attempts.clone();
        scheduler
            .schedule(id.clone(), move |token: CancellationToken| {
                let canceller = canceller.clone();
                let cancel_id = cancel_id.clone();
                let seen = seen.clone();
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    // Shutdown or removal lands while the attempt is running.
                    canceller.cancel(&cancel_id);
                    if token.is_cancelled() {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    ReconnectAttempt::Retry
                }
            })
            .unwrap();

        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(seen_cancelled.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled(&id));
    }
}
