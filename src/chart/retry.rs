use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Fixed-delay retry policy: up to `max_attempts` tries with a constant
/// wait between them. No backoff growth, no jitter, no overall deadline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Runs `operation` until it succeeds, the `retryable` predicate rejects
    /// the error, or the attempt budget is spent. Non-retryable errors are
    /// returned immediately without consuming further attempts.
    pub async fn run<T, E, F, Fut, P>(&self, mut operation: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1u32;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= self.max_attempts || !retryable(&error) {
                        return Err(error);
                    }

                    warn!(
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, self.max_attempts, error, self.delay
                    );
                    attempt += 1;
                    sleep(self.delay).await;
                }
            }
        }
    }
}
