// volchain-node/src/barrier.rs

//! Synchronous-wait primitives.
//!
//! A caller that must not reply before its transactions are sealed waits on
//! a `Barrier`. The producer calls `notify_sealed` after every block; waiters
//! re-check their condition on each notification and, as a fallback, every
//! `poll` interval until `timeout` elapses.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Cumulative barrier counters
#[derive(Debug, Default)]
pub struct BarrierMetrics {
    wait_ms_total: AtomicU64,
    timeouts_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierMetricsSnapshot {
    pub wait_ms_total: u64,
    pub timeouts_total: u64,
}

impl BarrierMetrics {
    fn record(&self, outcome: &WaitOutcome) {
        self.wait_ms_total.fetch_add(outcome.wait_ms, Ordering::Relaxed);
        if outcome.timed_out {
            self.timeouts_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> BarrierMetricsSnapshot {
        BarrierMetricsSnapshot {
            wait_ms_total: self.wait_ms_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
        }
    }
}

/// Result of one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitOutcome {
    pub ok: bool,
    pub wait_ms: u64,
    pub loops: u32,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct Barrier {
    sealed: Arc<Notify>,
    metrics: Arc<BarrierMetrics>,
    poll: Duration,
    timeout: Duration,
}

impl Barrier {
    pub fn new(poll: Duration, timeout: Duration) -> Self {
        Self {
            sealed: Arc::new(Notify::new()),
            metrics: Arc::new(BarrierMetrics::default()),
            poll: poll.max(Duration::from_millis(1)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wake every current waiter
    pub fn notify_sealed(&self) {
        self.sealed.notify_waiters();
    }

    pub fn metrics(&self) -> BarrierMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Wait until `check` returns true or `timeout` elapses
    pub async fn wait_until<F, Fut>(&self, timeout: Duration, mut check: F) -> WaitOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut loops = 0u32;

        let ok = loop {
            loops += 1;
            // register before checking so a seal between the check and the
            // wait is not missed
            let notified = self.sealed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if check().await {
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            let nap = self.poll.min(deadline - now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
            }
        };

        let outcome = WaitOutcome {
            ok,
            wait_ms: start.elapsed().as_millis() as u64,
            loops,
            timed_out: !ok,
        };
        self.metrics.record(&outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_immediate_success() {
        let barrier = Barrier::new(Duration::from_millis(10), Duration::from_millis(100));
        let outcome = barrier.wait_until(barrier.timeout(), || async { true }).await;
        assert!(outcome.ok);
        assert_eq!(outcome.loops, 1);
        assert_eq!(barrier.metrics().timeouts_total, 0);
    }

    #[tokio::test]
    async fn test_timeout_counts() {
        let barrier = Barrier::new(Duration::from_millis(5), Duration::from_millis(30));
        let outcome = barrier.wait_until(barrier.timeout(), || async { false }).await;
        assert!(!outcome.ok);
        assert!(outcome.timed_out);
        assert!(outcome.loops >= 2);
        assert_eq!(barrier.metrics().timeouts_total, 1);
    }

    #[tokio::test]
    async fn test_notification_wakes_waiter() {
        // poll far longer than the test so only the notification can wake it
        let barrier = Barrier::new(Duration::from_secs(30), Duration::from_secs(30));
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let barrier = barrier.clone();
            let flag = flag.clone();
            tokio::spawn(async move {
                barrier
                    .wait_until(barrier.timeout(), || {
                        let flag = flag.clone();
                        async move { flag.load(Ordering::SeqCst) }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.store(true, Ordering::SeqCst);
        barrier.notify_sealed();

        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert!(outcome.ok);
        assert!(outcome.wait_ms < 5_000);
    }
}
