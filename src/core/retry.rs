use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::error::EngineResult;

/// Bounded exponential backoff for transient network failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// No retries and no sleeping; handy for tests.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based): 2^attempt * base, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.min(32));
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> EngineResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        label, attempt, attempts, delay, err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> EngineError {
        EngineError::Network {
            url: "https://example.com".into(),
            message: "reset".into(),
        }
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(6), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let result = policy
            .run("op", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(transient())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let result: EngineResult<()> = policy
            .run("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Other("boom".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let result: EngineResult<()> = policy
            .run("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;
        assert!(matches!(result, Err(EngineError::Network { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
