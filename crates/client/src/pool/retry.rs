//! Exponential backoff with jitter for pool connect attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::ClientError;
use crate::settings::RetrySettings;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    pub fn max_attempts(&self) -> u32 {
        self.settings.max_attempts.max(1)
    }

    /// Delay before attempt `attempt + 1`: base * 2^(attempt-1), capped,
    /// then ±jitter_factor.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.settings.base_delay_ms;
        let exponential = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped = exponential.min(self.settings.max_delay_ms);

        let jitter_range = (capped as f64 * self.settings.jitter_factor) as i64;
        let millis = if jitter_range > 0 {
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped as i64 + jitter).max(0) as u64
        } else {
            capped
        };
        Duration::from_millis(millis)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        operation,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!(attempt, error = %e, operation, "Giving up after retries");
                    } else {
                        tracing::error!(error = %e, operation, "Non-retryable failure");
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
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, jitter_factor: f64) -> RetryPolicy {
        RetryPolicy::new(RetrySettings {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter_factor,
        })
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = policy(5, 0.0);
        assert_eq!(policy.delay(1), Duration::from_millis(1));
        assert_eq!(policy.delay(2), Duration::from_millis(2));
        assert_eq!(policy.delay(3), Duration::from_millis(4));
        assert_eq!(policy.delay(10), Duration::from_millis(4));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::new(RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 1000,
            jitter_factor: 0.2,
        });
        for _ in 0..100 {
            let delay = policy.delay(1).as_millis();
            assert!((800..=1200).contains(&delay), "{delay}");
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = policy(4, 0.2)
            .run("connect", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ClientError::connection("refused"))
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
    async fn never_retries_protocol_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(4, 0.0)
            .run("connect", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClientError::protocol("bad negotiation")) }
            })
            .await;

        assert!(matches!(result, Err(ClientError::ProtocolViolation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(3, 0.0)
            .run("connect", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClientError::connection("refused")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
