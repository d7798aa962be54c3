//! Long-poll registry
//!
//! Maps (instance, order) to suspended status requests. The payment
//! coordinator resumes waiters when a payment completes; the refund
//! ledger resumes them when the authorized total grows. A sweeper task
//! fires periodically and completes expired waiters with the
//! not-yet-happened answer so no request hangs past its deadline.
//!
//! Waiters hold only a oneshot sender; completing the HTTP response is
//! the handler's job. A cancelled request drops its receiver and the
//! next sweep discards the dead waiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};

use crate::amount::Amount;

/// How often the sweeper evicts expired waiters.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Why a waiter was resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeEvent {
    /// The order was paid.
    Paid,
    /// The authorized refund total reached this value.
    RefundIncreased(Amount),
    /// The deadline passed without a matching event.
    Timeout,
}

struct Waiter {
    deadline: Instant,
    /// `Some`: only wake once the refund total reaches this amount.
    /// `None`: wake on any state change.
    min_refund: Option<Amount>,
    tx: oneshot::Sender<WakeEvent>,
}

/// Single-process registry of suspended long-poll requests.
pub struct LongPollRegistry {
    waiters: Mutex<HashMap<(String, String), Vec<Waiter>>>,
}

impl Default for LongPollRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LongPollRegistry {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Register a waiter and suspend until resumed or the deadline
    /// passes. The extra grace period covers the window where the
    /// sweeper has not run yet.
    pub async fn wait(
        &self,
        instance_id: &str,
        order_id: &str,
        timeout: Duration,
        min_refund: Option<Amount>,
    ) -> WakeEvent {
        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.waiters.lock().await;
            map.entry((instance_id.to_string(), order_id.to_string()))
                .or_default()
                .push(Waiter {
                    deadline: Instant::now() + timeout,
                    min_refund,
                    tx,
                });
        }

        match tokio::time::timeout(timeout + 2 * SWEEP_INTERVAL, rx).await {
            Ok(Ok(event)) => event,
            // Sender dropped or grace period exceeded.
            _ => WakeEvent::Timeout,
        }
    }

    /// Wake all plain status waiters of an order after payment.
    pub async fn resume_paid(&self, instance_id: &str, order_id: &str) {
        let mut map = self.waiters.lock().await;
        let key = (instance_id.to_string(), order_id.to_string());
        if let Some(waiters) = map.get_mut(&key) {
            let mut kept = Vec::new();
            for w in waiters.drain(..) {
                if w.min_refund.is_none() {
                    let _ = w.tx.send(WakeEvent::Paid);
                } else {
                    kept.push(w);
                }
            }
            *waiters = kept;
            if waiters.is_empty() {
                map.remove(&key);
            }
        }
    }

    /// Wake waiters after a refund increase: plain status waiters always,
    /// minimum-refund waiters once the total reaches their threshold.
    pub async fn resume_refund(&self, instance_id: &str, order_id: &str, total: &Amount) {
        let mut map = self.waiters.lock().await;
        let key = (instance_id.to_string(), order_id.to_string());
        if let Some(waiters) = map.get_mut(&key) {
            let mut kept = Vec::new();
            for w in waiters.drain(..) {
                let satisfied = match &w.min_refund {
                    None => true,
                    Some(min) => matches!(
                        total.cmp_checked(min),
                        Ok(std::cmp::Ordering::Greater) | Ok(std::cmp::Ordering::Equal)
                    ),
                };
                if satisfied {
                    let _ = w.tx.send(WakeEvent::RefundIncreased(total.clone()));
                } else {
                    kept.push(w);
                }
            }
            *waiters = kept;
            if waiters.is_empty() {
                map.remove(&key);
            }
        }
    }

    /// Evict expired and cancelled waiters. Expired ones are completed
    /// with `Timeout`; cancelled ones (receiver dropped) are discarded.
    pub async fn sweep(&self, now: Instant) {
        let mut map = self.waiters.lock().await;
        let mut empty_keys = Vec::new();
        for (key, waiters) in map.iter_mut() {
            let mut kept = Vec::new();
            for w in waiters.drain(..) {
                if w.tx.is_closed() {
                    continue;
                }
                if w.deadline <= now {
                    let _ = w.tx.send(WakeEvent::Timeout);
                    continue;
                }
                kept.push(w);
            }
            if kept.is_empty() {
                empty_keys.push(key.clone());
            } else {
                *waiters = kept;
            }
        }
        for key in empty_keys {
            map.remove(&key);
        }
    }

    /// Spawn the background sweeper tied to the registry handle.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                registry.sweep(Instant::now()).await;
            }
        });
    }

    /// Number of registered waiters (diagnostics).
    pub async fn waiter_count(&self) -> usize {
        self.waiters.lock().await.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eur(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_paid_wakes_status_waiter() {
        let registry = Arc::new(LongPollRegistry::new());
        let r = registry.clone();
        let handle = tokio::spawn(async move {
            r.wait("default", "1", Duration::from_secs(5), None).await
        });

        // Let the waiter register before resuming.
        tokio::task::yield_now().await;
        while registry.waiter_count().await == 0 {
            tokio::task::yield_now().await;
        }

        registry.resume_paid("default", "1").await;
        assert_eq!(handle.await.unwrap(), WakeEvent::Paid);
        assert_eq!(registry.waiter_count().await, 0);
    }

    #[tokio::test]
    async fn test_refund_threshold_gating() {
        let registry = Arc::new(LongPollRegistry::new());
        let r = registry.clone();
        let handle = tokio::spawn(async move {
            r.wait(
                "default",
                "1",
                Duration::from_secs(5),
                Some(eur("EUR:0.10")),
            )
            .await
        });

        while registry.waiter_count().await == 0 {
            tokio::task::yield_now().await;
        }

        // Below the threshold: the waiter stays suspended.
        registry
            .resume_refund("default", "1", &eur("EUR:0.05"))
            .await;
        assert_eq!(registry.waiter_count().await, 1);

        // Reaching the threshold wakes it.
        registry
            .resume_refund("default", "1", &eur("EUR:0.10"))
            .await;
        assert_eq!(
            handle.await.unwrap(),
            WakeEvent::RefundIncreased(eur("EUR:0.10"))
        );
    }

    #[tokio::test]
    async fn test_payment_does_not_wake_refund_waiter() {
        let registry = Arc::new(LongPollRegistry::new());
        let r = registry.clone();
        let _handle = tokio::spawn(async move {
            r.wait(
                "default",
                "1",
                Duration::from_secs(5),
                Some(eur("EUR:0.10")),
            )
            .await
        });

        while registry.waiter_count().await == 0 {
            tokio::task::yield_now().await;
        }

        registry.resume_paid("default", "1").await;
        assert_eq!(registry.waiter_count().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_times_out_expired_waiters() {
        let registry = Arc::new(LongPollRegistry::new());
        let r = registry.clone();
        let handle = tokio::spawn(async move {
            r.wait("default", "1", Duration::from_millis(1), None).await
        });

        while registry.waiter_count().await == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.sweep(Instant::now()).await;
        assert_eq!(handle.await.unwrap(), WakeEvent::Timeout);
        assert_eq!(registry.waiter_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_discards_cancelled_waiters() {
        let registry = Arc::new(LongPollRegistry::new());
        let r = registry.clone();
        let handle = tokio::spawn(async move {
            r.wait("default", "1", Duration::from_secs(30), None).await
        });

        while registry.waiter_count().await == 0 {
            tokio::task::yield_now().await;
        }

        // Cancel the request; its receiver is dropped with it.
        handle.abort();
        let _ = handle.await;

        registry.sweep(Instant::now()).await;
        assert_eq!(registry.waiter_count().await, 0);
    }

    #[tokio::test]
    async fn test_orders_are_independent() {
        let registry = Arc::new(LongPollRegistry::new());
        let r = registry.clone();
        let other = tokio::spawn(async move {
            r.wait("default", "2", Duration::from_secs(5), None).await
        });

        while registry.waiter_count().await == 0 {
            tokio::task::yield_now().await;
        }

        registry.resume_paid("default", "1").await;
        assert_eq!(registry.waiter_count().await, 1);
        other.abort();
    }
}
