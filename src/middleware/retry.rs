use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::core::errors::{VisionError, VisionResult};

/// Exponential backoff with random jitter for transient remote failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay added to each wait
    pub max_jitter: Duration,
    /// Fixed wait after a 429/503 response
    pub throttle_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(1000),
            throttle_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::with_max_retries(0)
    }

    /// Wait before retry number `attempt` (0-based) after `error`.
    pub fn delay_for(&self, attempt: u32, error: &VisionError) -> Duration {
        let throttled = matches!(
            error,
            VisionError::Status { status: 429 | 503, .. }
        );
        let base = if throttled {
            self.throttle_delay
        } else {
            self.base_delay
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(self.max_delay)
        };

        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::random::<u64>() % jitter_ms)
        };
        base + jitter
    }
}

/// Run `f` until it succeeds, fails with a non-transient error, or the
/// policy's retries are exhausted. The last error is returned unchanged.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut f: F) -> VisionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = VisionResult<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            // An open circuit will not close within a backoff window.
            Err(e @ VisionError::CircuitOpen) => return Err(e),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt, &e);
                debug!(
                    "Vision request failed: {}. Retrying in {:?} ({}/{})",
                    e,
                    delay,
                    attempt + 1,
                    policy.max_retries
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_jitter: Duration::ZERO,
            throttle_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(3), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(VisionError::Status { status: 503, body: String::new() })
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: VisionResult<()> = with_retry(&fast_policy(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(VisionError::Unavailable("down".into()))
        })
        .await;

        assert!(matches!(result, Err(VisionError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: VisionResult<()> = with_retry(&fast_policy(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(VisionError::Status { status: 400, body: "bad image".into() })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..Default::default()
        };
        let err = VisionError::Unavailable("x".into());
        assert_eq!(policy.delay_for(0, &err), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, &err), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10, &err), Duration::from_secs(30));

        let throttled = VisionError::Status { status: 429, body: String::new() };
        assert_eq!(policy.delay_for(0, &throttled), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        let err = VisionError::Unavailable("x".into());
        for _ in 0..50 {
            let delay = policy.delay_for(0, &err);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_secs(2));
        }
    }
}
