use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Explicit retry policy threaded through constructors.
///
/// Different callers want very different shapes: the consensus-store proxy
/// retries quickly a handful of times before tripping its breaker, while a
/// base backup may legitimately need many slow attempts against a leader
/// that is still starting up. Each caller gets its own value instead of a
/// process-global knob.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Policy for consensus-store calls: fail fast, let the breaker decide.
    pub const fn dcs() -> Self {
        Self::new(5, Duration::from_millis(200), Duration::from_secs(5))
    }

    /// Policy for base backups: patient, the leader may still be warming up.
    pub const fn base_backup() -> Self {
        Self::new(10, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Policy for readiness probes against a peer.
    pub const fn readiness() -> Self {
        Self::new(30, Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Backoff before retry number `attempt` (0-based), doubled per attempt
    /// and capped, with up to 25% random jitter added.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let capped = exp.min(self.max_delay);
        let jitter_budget = (capped.as_millis() as u64) / 4;
        let jitter = if jitter_budget == 0 {
            0
        } else {
            rand::random::<u64>() % (jitter_budget + 1)
        };
        capped + Duration::from_millis(jitter)
    }

    /// Run `op` until it succeeds or attempts are exhausted, sleeping the
    /// policy's backoff between attempts. The backoff sleep races `cancel`;
    /// cancellation surfaces the most recent error immediately.
    pub async fn run<T, E, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || cancel.is_cancelled() {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt - 1);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1));
        // Jitter adds at most 25%, so compare against the capped base.
        assert!(policy.delay_for(0) >= Duration::from_millis(100));
        assert!(policy.delay_for(0) <= Duration::from_millis(125));
        assert!(policy.delay_for(3) >= Duration::from_millis(800));
        assert!(policy.delay_for(20) <= Duration::from_millis(1250));
    }

    #[test]
    fn test_delay_never_overflows_on_large_attempts() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(10), Duration::from_secs(30));
        assert!(policy.delay_for(u32::MAX) <= Duration::from_millis(37_500));
    }

    #[tokio::test]
    async fn test_run_stops_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), String> = policy
            .run(&cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_returns_first_success() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<u32, String> = policy
            .run(&cancel, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("warming up".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_honours_cancellation() {
        let policy = RetryPolicy::new(100, Duration::from_secs(30), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), String> = policy
            .run(&cancel, || async { Err("down".to_string()) })
            .await;

        // Cancelled before the first backoff sleep could block us.
        assert!(result.is_err());
    }
}
