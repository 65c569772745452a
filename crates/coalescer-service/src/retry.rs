//! Bounded retries with exponential backoff and per-attempt timeouts.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::CoalescerConfig;
use crate::error::CoalescerError;
use crate::executor::Executor;
use crate::types::RequestConfig;

/// Retry and timeout settings, applied unless a request overrides them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub default_retries: u32,
    pub default_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CoalescerConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            default_retries: config.default_retries,
            default_timeout: config.default_timeout,
        }
    }

    /// The upper bound of the delay before retry number `retry`, starting at `1`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// The actual delay before retry number `retry`.
    ///
    /// This is drawn uniformly between the base delay and [`backoff`](Self::backoff), so that
    /// concurrent retries spread out.
    pub fn jittered_backoff(&self, retry: u32) -> Duration {
        let upper = self.backoff(retry);
        let lower = self.base_delay.min(upper);
        if lower >= upper {
            return upper;
        }
        rand::thread_rng().gen_range(lower..=upper)
    }
}

/// The outcome of [`RetryEngine::execute`].
#[derive(Debug)]
pub struct Attempted {
    pub result: Result<Value, CoalescerError>,
    /// The number of retries, not counting the first attempt.
    pub retries: u32,
    /// How many attempts ran into their timeout.
    pub timeouts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryEngine {
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `config` on `executor` until it succeeds, fails permanently, or runs out of retries.
    ///
    /// Triggering `cancel` aborts the running attempt or backoff and fails with
    /// [`CoalescerError::Cancelled`].
    pub async fn execute(
        &self,
        executor: &dyn Executor,
        config: &RequestConfig,
        cancel: &CancellationToken,
    ) -> Attempted {
        let max_retries = config.retries.unwrap_or(self.policy.default_retries);
        let timeout = config.timeout.unwrap_or(self.policy.default_timeout);

        let mut retries = 0;
        let mut timeouts = 0;
        loop {
            let error = match attempt(executor, config, timeout, cancel).await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        retries,
                        timeouts,
                    };
                }
                Err(error) => error,
            };

            if matches!(error, CoalescerError::Timeout(_)) {
                timeouts += 1;
            }

            if !error.is_retryable() || retries >= max_retries {
                let error = if retries > 0 && error.is_retryable() {
                    tracing::warn!(
                        endpoint = %config.endpoint,
                        %error,
                        "Request failed after {} retries",
                        retries
                    );
                    CoalescerError::RetriesExhausted {
                        attempts: retries + 1,
                        last: Box::new(error),
                    }
                } else {
                    error
                };
                return Attempted {
                    result: Err(error),
                    retries,
                    timeouts,
                };
            }

            retries += 1;
            let delay = self.policy.jittered_backoff(retries);
            tracing::debug!(endpoint = %config.endpoint, %error, ?delay, "Retrying request");

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return Attempted {
                        result: Err(CoalescerError::Cancelled),
                        retries,
                        timeouts,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn attempt(
    executor: &dyn Executor,
    config: &RequestConfig,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Value, CoalescerError> {
    // creating the future runs user code as well, so it happens inside `catch_unwind`
    let future =
        AssertUnwindSafe(async { executor.execute(config.clone()).await }).catch_unwind();

    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(CoalescerError::Cancelled),
        result = tokio::time::timeout(timeout, future) => match result {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(CoalescerError::from_executor(error)),
            Ok(Err(panic)) => Err(CoalescerError::Transport(panic_message(&*panic))),
            Err(_) => Err(CoalescerError::Timeout(timeout)),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("executor panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("executor panicked: {message}")
    } else {
        "executor panicked".into()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use tokio::time::Instant;

    use crate::test::MockExecutor;

    use super::*;

    fn engine() -> RetryEngine {
        RetryEngine::new(RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            default_retries: 3,
            default_timeout: Duration::from_secs(30),
        })
    }

    #[test]
    fn test_backoff() {
        let policy = engine().policy;
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(7), Duration::from_secs(5));
        assert_eq!(policy.backoff(100), Duration::from_secs(5));

        for retry in 1..10 {
            let delay = policy.jittered_backoff(retry);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= policy.backoff(retry));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let executor = MockExecutor::failing_times(2, CoalescerError::Status(503));
        let attempted = engine()
            .execute(
                &executor,
                &RequestConfig::new("/a"),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(executor.call_count(), 3);
        assert_eq!(attempted.retries, 2);
        assert!(attempted.result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let executor = MockExecutor::always_failing(CoalescerError::Status(500));
        let config = RequestConfig::new("/a").with_retries(2);

        let start = Instant::now();
        let attempted = engine()
            .execute(&executor, &config, &CancellationToken::new())
            .await;

        assert_eq!(executor.call_count(), 3);
        assert_eq!(
            attempted.result.unwrap_err(),
            CoalescerError::RetriesExhausted {
                attempts: 3,
                last: Box::new(CoalescerError::Status(500)),
            }
        );
        // two backoffs of at least the base delay each
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() <= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retries_surfaces_error() {
        let executor = MockExecutor::always_failing(CoalescerError::Status(500));
        let config = RequestConfig::new("/a").with_retries(0);
        let attempted = engine()
            .execute(&executor, &config, &CancellationToken::new())
            .await;

        assert_eq!(executor.call_count(), 1);
        assert_eq!(attempted.result.unwrap_err(), CoalescerError::Status(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error() {
        let executor = MockExecutor::always_failing(CoalescerError::Validation("bad".into()));
        let attempted = engine()
            .execute(
                &executor,
                &RequestConfig::new("/a"),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(executor.call_count(), 1);
        assert_eq!(attempted.retries, 0);
        assert!(matches!(
            attempted.result,
            Err(CoalescerError::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = {
            let calls = calls.clone();
            move |_config: RequestConfig| {
                let call = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if call == 0 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok::<_, anyhow::Error>(json!("done"))
                }
            }
        };
        let config = RequestConfig::new("/a").with_timeout(Duration::from_secs(1));

        let attempted = engine()
            .execute(&executor, &config, &CancellationToken::new())
            .await;

        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(attempted.timeouts, 1);
        assert_eq!(attempted.result.unwrap(), json!("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_attempt() {
        let executor = MockExecutor::echo().with_delay(Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let engine = engine();
        let config = RequestConfig::new("/a");
        let execution = engine.execute(&executor, &config, &cancel);
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        };

        let (attempted, ()) = tokio::join!(execution, canceller);
        assert_eq!(attempted.result.unwrap_err(), CoalescerError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_becomes_transport_error() {
        let executor = |_config: RequestConfig| async move {
            if true {
                panic!("boom");
            }
            Ok::<_, anyhow::Error>(Value::Null)
        };
        let config = RequestConfig::new("/a").with_retries(0);
        let attempted = engine()
            .execute(&executor, &config, &CancellationToken::new())
            .await;

        assert_eq!(
            attempted.result.unwrap_err(),
            CoalescerError::Transport("executor panicked: boom".into())
        );
    }
}
