use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::AppConfig;
use crate::error::AppError;

/// Bounded, jittered exponential backoff for persistence calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 120,
            max_backoff_ms: 2000,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.db_retry_max_attempts.max(1),
            base_backoff_ms: config.db_retry_base_backoff_ms.max(1),
            max_backoff_ms: config
                .db_retry_max_backoff_ms
                .max(config.db_retry_base_backoff_ms),
        }
    }

    /// Deterministic part of the delay: base doubled per attempt, capped.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms)
    }

    /// Delay before the next attempt, with up to +50% random jitter so
    /// concurrent retriers do not stampede in lockstep.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt);
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }
}

/// Run an operation, retrying transient failures under `policy`.
///
/// Permanent errors return immediately; the final transient error is
/// surfaced unchanged once attempts are exhausted. The operation must
/// be safe to re-run (every store call here is idempotent).
pub async fn run_with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.jittered_delay(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient storage failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_backoff_ms: 1,
            max_backoff_ms: 4,
        }
    }

    #[test]
    fn delays_double_then_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_backoff_ms: 120,
            max_backoff_ms: 2000,
        };
        assert_eq!(policy.base_delay_ms(1), 120);
        assert_eq!(policy.base_delay_ms(2), 240);
        assert_eq!(policy.base_delay_ms(3), 480);
        assert_eq!(policy.base_delay_ms(4), 960);
        assert_eq!(policy.base_delay_ms(5), 1920);
        assert_eq!(policy.base_delay_ms(6), 2000);
        assert_eq!(policy.base_delay_ms(60), 2000);
    }

    #[test]
    fn jitter_stays_within_half_the_base() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        for _ in 0..50 {
            let delay = policy.jittered_delay(1).as_millis() as u64;
            assert!((100..=150).contains(&delay), "delay out of range: {delay}");
        }
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&fast_policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(AppError::Dependency("connection reset".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run_with_retry(&fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::Dependency("still down".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(AppError::Dependency(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run_with_retry(&fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::BadRequest("bad input".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
