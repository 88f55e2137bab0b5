use std::future::Future;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

use super::BackendError;

/// Bounded, fixed-delay retry for backend calls. Every attempt is capped by
/// `attempt_timeout`; a timeout counts as a retriable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Returned when the policy gives up, either because attempts ran out or
/// because the backend answered with something retrying won't fix.
#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: BackendError,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            attempt_timeout,
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match with_timeout(self.attempt_timeout, call()).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempts = attempt, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retriable() => {
                    return Err(RetryFailure { attempts: attempt, error: e });
                }
                Err(e) => {
                    if attempt >= self.max_attempts {
                        error!(
                            operation,
                            error = e.to_string(),
                            attempts = attempt,
                            "Maximum retries reached, operation failed"
                        );
                        return Err(RetryFailure { attempts: attempt, error: e });
                    }
                    warn!(
                        operation,
                        error = e.to_string(),
                        retry_count = attempt,
                        max_retries = self.max_attempts,
                        "Operation failed, retrying"
                    );
                    time::sleep(self.delay).await;
                }
            }
        }
    }
}

/// Runs one backend call under a deadline.
pub async fn with_timeout<T, Fut>(limit: Duration, call: Fut) -> Result<T, BackendError>
where
    Fut: Future<Output = Result<T, BackendError>>,
{
    match time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(limit)),
    }
}
