//! Capped exponential backoff for storage operations
//!
//! Database errors are never allowed to surface into the engine: losing a
//! read or write of the transaction queue would break nonce monotonicity, so
//! the only correct behavior is to retry until the operation succeeds or the
//! engine shuts down.

use crate::config::RetryConfig;
use crate::error::{EngineError, EngineResult};

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Retry policy with capped exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    factor: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            factor: config.factor,
        }
    }

    /// Run `op` until it succeeds, backing off between attempts.
    ///
    /// Returns `EngineError::Cancelled` when the shutdown signal fires while
    /// waiting; this is the only way out other than success.
    pub async fn with_retry<T, F, Fut>(
        &self,
        shutdown: &watch::Receiver<bool>,
        op_name: &str,
        mut op: F,
    ) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut shutdown = shutdown.clone();
        if *shutdown.borrow() {
            return Err(EngineError::Cancelled);
        }

        let mut delay = self.initial_delay;
        let mut attempt: u64 = 0;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("{} succeeded after {} retries", op_name, attempt);
                    }
                    return Ok(value);
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    attempt += 1;
                    warn!(
                        "{} failed (attempt {}), retrying in {:?}: {}",
                        op_name, attempt, delay, e
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Err(EngineError::Cancelled);
                    }
                }
            }

            let next = delay.as_millis() as f64 * self.factor;
            delay = Duration::from_millis(next as u64).min(self.max_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            factor: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (_, rx) = watch::channel(false);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = fast_policy()
            .with_retry(&rx, "flaky op", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(EngineError::Internal("not yet".to_string()))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retry() {
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            fast_policy()
                .with_retry(&rx, "never succeeds", || async {
                    Err::<(), _>(EngineError::Internal("boom".to_string()))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_delay_caps_at_max() {
        let policy = fast_policy();
        let mut delay = policy.initial_delay;
        for _ in 0..10 {
            let next = delay.as_millis() as f64 * policy.factor;
            delay = Duration::from_millis(next as u64).min(policy.max_delay);
        }
        assert_eq!(delay, policy.max_delay);
    }
}
