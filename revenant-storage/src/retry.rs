//! Bounded exponential backoff for content store calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use revenant_core::{RetryConfig, StorageTier, StoreError};

use crate::StoreResult;

/// Add a random delay in `[0, jitter]` to `base`.
pub fn jittered_backoff(base: Duration, jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return base;
    }
    let extra = rand::rng().random_range(0..=jitter_ms);
    base.saturating_add(Duration::from_millis(extra))
}

/// Retries transient store failures with jittered exponential backoff.
///
/// Only `Unavailable` and `Backend` errors are retried. A miss or a corrupt
/// object is returned immediately so the caller can fall through to the next
/// tier or surface the mismatch.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, tier: StorageTier, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = jittered_backoff(self.config.backoff_for(attempt), self.config.jitter);
                    tracing::debug!(
                        operation,
                        tier = %tier,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying store call"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(
                            operation,
                            tier = %tier,
                            attempts = attempt,
                            error = %e,
                            "Store call failed after retries"
                        );
                        return Err(StoreError::Unavailable {
                            tier,
                            reason: format!("{} failed after {} attempts: {}", operation, attempt, e),
                        });
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revenant_core::ContentAddress;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_jitter_is_bounded() {
        let base = Duration::from_millis(200);
        for _ in 0..100 {
            let d = jittered_backoff(base, Duration::from_millis(100));
            assert!(d >= base && d <= Duration::from_millis(300));
        }
        assert_eq!(jittered_backoff(base, Duration::ZERO), base);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let policy = RetryPolicy::new(RetryConfig::immediate(3));
        let calls = AtomicU32::new(0);
        let result = policy
            .run("get", StorageTier::Hot, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Unavailable {
                        tier: StorageTier::Hot,
                        reason: "flaky".to_string(),
                    })
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let policy = RetryPolicy::new(RetryConfig::immediate(3));
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = policy
            .run("put", StorageTier::Warm, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Backend {
                    tier: StorageTier::Warm,
                    reason: "io".to_string(),
                })
            })
            .await;
        assert!(matches!(
            result,
            Err(StoreError::Unavailable {
                tier: StorageTier::Warm,
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let policy = RetryPolicy::new(RetryConfig::immediate(3));
        let calls = AtomicU32::new(0);
        let address = ContentAddress::for_content(b"x");
        let result: StoreResult<()> = policy
            .run("get", StorageTier::Cold, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::NotFound {
                    tier: StorageTier::Cold,
                    address,
                })
            })
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter: Duration::ZERO,
            ..RetryConfig::default()
        });
        let start = tokio::time::Instant::now();
        let result: StoreResult<()> = policy
            .run("get", StorageTier::Hot, || async {
                Err(StoreError::Unavailable {
                    tier: StorageTier::Hot,
                    reason: "down".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        // 200ms then 400ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(600));
        assert!(elapsed < Duration::from_millis(700));
    }
}
