//! Bounded exponential backoff with jitter for cluster calls.

use std::future::Future;
use std::time::Duration;

use conform_core::ClusterError;
use metrics::counter;
use rand::Rng;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Cap on any single delay (before jitter).
    pub max: Duration,
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    /// Up to this fraction of the delay is added at random.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
            max_attempts: 6,
            jitter: 0.25,
        }
    }
}

impl Backoff {
    /// Retries without sleeping; for tests and in-memory clusters.
    pub fn immediate(max_attempts: u32) -> Self {
        Self { base: Duration::ZERO, max: Duration::ZERO, max_attempts, jitter: 0.0 }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped, plus jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base.is_zero() {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max);
        if self.jitter <= 0.0 {
            return capped;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..=self.jitter);
        capped.mul_f64(factor)
    }
}

/// Run `op` until it succeeds, fails terminally, or attempts are exhausted.
/// Only retryable errors (conflict, already-exists, unavailable) are retried.
pub async fn retry<T, F, Fut>(backoff: &Backoff, what: &str, mut op: F) -> Result<T, ClusterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClusterError>>,
{
    let attempts = backoff.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => {
                if attempt > 1 {
                    debug!(op = %what, attempt, "succeeded after retry");
                }
                return Ok(v);
            }
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = backoff.delay(attempt);
                warn!(op = %what, attempt, error = %e, delay_ms = %delay.as_millis(), "retrying");
                counter!("conform_retries_total", 1u64, "op" => what.to_string());
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    error!(op = %what, attempts, error = %e, "retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_and_caps() {
        let b = Backoff { base: Duration::from_millis(100), max: Duration::from_millis(350), max_attempts: 5, jitter: 0.0 };
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(350));
        assert_eq!(b.delay(30), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let b = Backoff { base: Duration::from_millis(100), max: Duration::from_secs(1), max_attempts: 5, jitter: 0.25 };
        for _ in 0..50 {
            let d = b.delay(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(125), "d={:?}", d);
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = retry(&Backoff::immediate(4), "get", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err(ClusterError::Unavailable("busy".into())) } else { Ok(n) }
        })
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry(&Backoff::immediate(4), "create", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ClusterError::Invalid("bad spec".into()))
        })
        .await;
        assert!(matches!(out, Err(ClusterError::Invalid(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry(&Backoff::immediate(3), "update", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ClusterError::Conflict("stale".into()))
        })
        .await;
        assert!(matches!(out, Err(ClusterError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
