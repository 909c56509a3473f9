//! Bounded fixed-delay polling.
//!
//! Run discovery after a workflow dispatch has to poll GitHub until the new
//! run shows up. The attempt count and spacing live here, in data, so the
//! orchestrator never hardcodes a sleep and tests can poll with zero delay.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Production policy for dispatched-run discovery: ~12 s worst case.
    pub const fn run_discovery() -> Self {
        Self::new(12, Duration::from_secs(1))
    }

    /// Zero-delay policy for tests.
    pub const fn immediate(attempts: u32) -> Self {
        Self::new(attempts, Duration::ZERO)
    }

    /// Invoke `f` up to `attempts` times, sleeping `delay` between tries,
    /// returning the first `Some` it produces. `None` after the last try
    /// means the poll window closed without a result.
    pub async fn run_until<T, F, Fut>(&self, mut f: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Option<T>>,
    {
        for attempt in 0..self.attempts {
            if let Some(value) = f().await {
                return Some(value);
            }
            if attempt + 1 < self.attempts && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_returns_first_hit() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);
        let result = policy
            .run_until(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n == 2 { Some(n) } else { None } }
            })
            .await;
        assert_eq!(result, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(4);
        let result: Option<u32> = policy
            .run_until(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { None }
            })
            .await;
        assert_eq!(result, None);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_zero_attempts_never_calls() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(0);
        let result: Option<u32> = policy
            .run_until(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Some(1) }
            })
            .await;
        assert_eq!(result, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_production_policy_bounds() {
        let policy = RetryPolicy::run_discovery();
        assert_eq!(policy.attempts, 12);
        assert_eq!(policy.delay, Duration::from_secs(1));
    }
}
